//! Call configuration loaded from `config/call.toml` and the environment.

use crate::audio::MicrophoneConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::session::SessionConfig;
use crate::spectrum::AnalyserConfig;
use crate::vad::VadConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one client installation.
///
/// | Key | Env | Default |
/// |-----|-----|---------|
/// | server_url | CARTTALK_SERVER_URL | http://localhost:8000 |
/// | vad_threshold | CARTTALK_VAD_THRESHOLD | 15.0 |
/// | hangover_ms | CARTTALK_HANGOVER_MS | 1500 |
/// | poll_interval_ms | CARTTALK_POLL_INTERVAL_MS | 16 |
/// | fft_size | CARTTALK_FFT_SIZE | 512 |
/// | sample_rate | CARTTALK_SAMPLE_RATE | 16000 |
/// | encoder_frame_ms | CARTTALK_ENCODER_FRAME_MS | 250 |
/// | reply_timeout_ms | CARTTALK_REPLY_TIMEOUT_MS | 30000 (0 = wait forever) |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    pub server_url: String,
    pub vad_threshold: f32,
    pub hangover_ms: u64,
    pub poll_interval_ms: u64,
    pub fft_size: usize,
    pub sample_rate: u32,
    pub encoder_frame_ms: u64,
    pub reply_timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            vad_threshold: 15.0,
            hangover_ms: 1500,
            poll_interval_ms: 16,
            fft_size: 512,
            sample_rate: 16000,
            encoder_frame_ms: 250,
            reply_timeout_ms: 30_000,
        }
    }
}

impl CallConfig {
    /// Load config from file and environment. Precedence: env > `CARTTALK_CONFIG` file
    /// (default `config/call.toml`, optional) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("CARTTALK_CONFIG").unwrap_or_else(|_| "config/call".to_string());
        let defaults = Self::default();
        let built = config::Config::builder()
            .set_default("server_url", defaults.server_url)?
            .set_default("vad_threshold", defaults.vad_threshold as f64)?
            .set_default("hangover_ms", defaults.hangover_ms as i64)?
            .set_default("poll_interval_ms", defaults.poll_interval_ms as i64)?
            .set_default("fft_size", defaults.fft_size as i64)?
            .set_default("sample_rate", defaults.sample_rate as i64)?
            .set_default("encoder_frame_ms", defaults.encoder_frame_ms as i64)?
            .set_default("reply_timeout_ms", defaults.reply_timeout_ms as i64)?
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(
                config::Environment::with_prefix("CARTTALK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if !(0.0..=255.0).contains(&self.vad_threshold) {
            return Err(VoiceError::Config(format!(
                "vad_threshold must be within 0..=255, got {}",
                self.vad_threshold
            )));
        }
        if self.hangover_ms == 0 {
            return Err(VoiceError::Config("hangover_ms must be > 0".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(VoiceError::Config("poll_interval_ms must be > 0".to_string()));
        }
        if self.fft_size < 32 || !self.fft_size.is_power_of_two() {
            return Err(VoiceError::Config(format!(
                "fft_size must be a power of two >= 32, got {}",
                self.fft_size
            )));
        }
        if self.sample_rate == 0 || self.encoder_frame_ms == 0 {
            return Err(VoiceError::Config(
                "sample_rate and encoder_frame_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn vad(&self) -> VadConfig {
        VadConfig {
            threshold: self.vad_threshold,
            hangover: Duration::from_millis(self.hangover_ms),
        }
    }

    pub fn analyser(&self) -> AnalyserConfig {
        AnalyserConfig {
            fft_size: self.fft_size,
            ..AnalyserConfig::default()
        }
    }

    pub fn microphone(&self) -> MicrophoneConfig {
        MicrophoneConfig {
            sample_rate: self.sample_rate,
            encoder_frame: Duration::from_millis(self.encoder_frame_ms),
            analyser: self.analyser(),
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            vad: self.vad(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reply_timeout: (self.reply_timeout_ms > 0)
                .then(|| Duration::from_millis(self.reply_timeout_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_calibrated_constants() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
        let vad = config.vad();
        assert_eq!(vad.threshold, 15.0);
        assert_eq!(vad.hangover, Duration::from_millis(1500));
        assert_eq!(config.analyser().fft_size, 512);
    }

    #[test]
    fn zero_reply_timeout_means_unbounded() {
        let config = CallConfig {
            reply_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.session().reply_timeout.is_none());
        assert_eq!(
            CallConfig::default().session().reply_timeout,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let bad_fft = CallConfig {
            fft_size: 500,
            ..Default::default()
        };
        assert!(matches!(bad_fft.validate(), Err(VoiceError::Config(_))));

        let bad_threshold = CallConfig {
            vad_threshold: 300.0,
            ..Default::default()
        };
        assert!(bad_threshold.validate().is_err());

        let no_hangover = CallConfig {
            hangover_ms: 0,
            ..Default::default()
        };
        assert!(no_hangover.validate().is_err());
    }
}

//! Microphone capture using CPAL
//!
//! One input stream per call feeds two consumers: the sample window behind the
//! amplitude tap (read by the VAD on every tick) and, while an utterance is being
//! recorded, the frame encoder that turns PCM into transmit-ready chunks.
//!
//! The stream is opened at the utterance rate when the device supports it. When it
//! does not, the encoder resamples; the window always holds device-rate mono.

use crate::error::{VoiceError, VoiceResult};
use crate::resample::MonoResampler;
use crate::spectrum::{AnalyserConfig, SampleWindow, SpectrumAnalyser};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// MIME type of a finished utterance produced by [`MicrophoneSource`].
pub const UTTERANCE_MIME: &str = "audio/wav";

/// Where the encoder delivers its chunks, in capture order.
pub type ChunkSink = mpsc::UnboundedSender<Vec<u8>>;

/// Continuously updated amplitude reading on the 0-255 scale.
pub trait AmplitudeReader {
    fn level(&mut self) -> f32;
}

/// Owner of the live microphone stream for one call.
///
/// Acquired once at call start, shared by the VAD (through [`AudioInputSource::tap`])
/// and the utterance recorder (through the encoder), released at teardown.
pub trait AudioInputSource {
    /// Open the microphone. Fails with `PermissionDenied` when access is refused or
    /// no device exists, and with `AudioDevice`/`AudioStream` when the device is
    /// there but cannot be opened. Acquiring an already acquired source is a no-op.
    fn acquire(&mut self) -> VoiceResult<()>;

    /// Amplitude reader over the live stream.
    fn tap(&self) -> VoiceResult<Box<dyn AmplitudeReader>>;

    /// Start delivering encoded chunks to `sink`. Fails with `EncoderUnavailable`.
    fn start_encoder(&mut self, sink: ChunkSink) -> VoiceResult<()>;

    /// Stop the encoder. Every chunk captured before this call has been sent to the
    /// sink by the time it returns, and the sink is dropped.
    fn stop_encoder(&mut self);

    /// Stop all hardware capture. Idempotent.
    fn release(&mut self);
}

/// Microphone configuration
#[derive(Debug, Clone)]
pub struct MicrophoneConfig {
    /// Encoded sample rate in Hz (default: 16000)
    pub sample_rate: u32,
    /// PCM duration carried by each encoded chunk (default: 250ms)
    pub encoder_frame: Duration,
    pub analyser: AnalyserConfig,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            encoder_frame: Duration::from_millis(250),
            analyser: AnalyserConfig::default(),
        }
    }
}

/// Streaming WAV encoder: a header chunk, then 16-bit mono PCM frames at
/// `sample_rate`, resampled from `input_rate` when they differ.
pub struct WavStreamEncoder {
    sink: ChunkSink,
    resampler: MonoResampler,
    pending: Vec<u8>,
    frame_bytes: usize,
}

impl WavStreamEncoder {
    /// Create the encoder and emit the header chunk.
    pub fn start(
        sink: ChunkSink,
        input_rate: u32,
        sample_rate: u32,
        frame: Duration,
    ) -> VoiceResult<Self> {
        let resampler = MonoResampler::new(input_rate, sample_rate)
            .map_err(|e| VoiceError::EncoderUnavailable(e.to_string()))?;
        let frame_samples = (sample_rate as u128 * frame.as_millis() / 1000).max(1) as usize;
        sink.send(wav_stream_header(sample_rate))
            .map_err(|e| VoiceError::EncoderUnavailable(e.to_string()))?;
        Ok(Self {
            sink,
            resampler,
            pending: Vec::with_capacity(frame_samples * 2),
            frame_bytes: frame_samples * 2,
        })
    }

    /// Accept mono samples at the input rate.
    pub fn push(&mut self, samples: &[f32]) {
        if self.resampler.is_passthrough() {
            self.encode(samples);
        } else {
            let resampled = self.resampler.process(samples);
            self.encode(&resampled);
        }
    }

    /// Flush the resampler, send the partial frame if any, and drop the sink.
    pub fn finish(mut self) {
        let tail = self.resampler.flush();
        self.encode(&tail);
        if !self.pending.is_empty() {
            let _ = self.sink.send(std::mem::take(&mut self.pending));
        }
    }

    fn encode(&mut self, samples: &[f32]) {
        for &s in samples {
            let pcm = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
            self.pending.extend_from_slice(&pcm.to_le_bytes());
            if self.pending.len() >= self.frame_bytes {
                let frame = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_bytes));
                if self.sink.send(frame).is_err() {
                    debug!("encoder sink closed, dropping frame");
                }
            }
        }
    }
}

/// RIFF/WAVE header for 16-bit mono PCM of unknown length (sizes set to the
/// streaming sentinel `0xFFFFFFFF`).
pub fn wav_stream_header(sample_rate: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(44);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&u32::MAX.to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // subchunk1 size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&u32::MAX.to_le_bytes());
    buf
}

/// Amplitude tap: copies the shared window under the lock, analyses outside it.
struct AnalyserTap {
    window: Arc<Mutex<SampleWindow>>,
    analyser: SpectrumAnalyser,
    scratch: Vec<f32>,
}

impl AmplitudeReader for AnalyserTap {
    fn level(&mut self) -> f32 {
        match self.window.lock() {
            Ok(window) => window.copy_to(&mut self.scratch),
            Err(poisoned) => poisoned.into_inner().copy_to(&mut self.scratch),
        }
        self.analyser.level(&self.scratch)
    }
}

/// Default-device microphone.
pub struct MicrophoneSource {
    config: MicrophoneConfig,
    window: Arc<Mutex<SampleWindow>>,
    encoder: Arc<Mutex<Option<WavStreamEncoder>>>,
    stream: Option<Stream>,
    device_rate: u32,
}

impl MicrophoneSource {
    pub fn new(config: MicrophoneConfig) -> Self {
        let window = SampleWindow::new(config.analyser.fft_size);
        Self {
            device_rate: config.sample_rate,
            config,
            window: Arc::new(Mutex::new(window)),
            encoder: Arc::new(Mutex::new(None)),
            stream: None,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.stream.is_some()
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }

    /// Prefer a config at the utterance rate, fewest channels first, then F32 over
    /// I16. Falls back to the device default.
    fn pick_input_config(&self, device: &cpal::Device) -> VoiceResult<SupportedStreamConfig> {
        let target = SampleRate(self.config.sample_rate);
        match device.supported_input_configs() {
            Ok(ranges) => {
                let mut matching: Vec<_> = ranges
                    .filter(|r| check_sample_format(r.sample_format()).is_ok())
                    .filter(|r| r.min_sample_rate() <= target && target <= r.max_sample_rate())
                    .collect();
                matching.sort_by_key(|r| (r.channels(), r.sample_format() != SampleFormat::F32));
                if let Some(range) = matching.into_iter().next() {
                    return Ok(range.with_sample_rate(target));
                }
            }
            Err(e) => debug!("supported input configs unavailable: {}", e),
        }
        Ok(device.default_input_config()?)
    }

    /// Build the input stream; downmix to mono, then fan out to the sample window
    /// and the armed encoder.
    fn build_stream(&self, device: &cpal::Device) -> VoiceResult<(Stream, u32)> {
        let supported = self.pick_input_config(device)?;
        check_sample_format(supported.sample_format())?;

        let device_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        let stream_config: StreamConfig = supported.config();

        debug!(
            device_rate,
            channels,
            target_rate = self.config.sample_rate,
            "microphone stream config"
        );

        let stream = match supported.sample_format() {
            SampleFormat::I16 => {
                let sink = CaptureSink::new(self, channels);
                device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                        sink.accept(&samples)
                    },
                    move |err| warn!("Microphone stream error: {}", err),
                    None,
                )?
            }
            _ => {
                let sink = CaptureSink::new(self, channels);
                device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| sink.accept(data),
                    move |err| warn!("Microphone stream error: {}", err),
                    None,
                )?
            }
        };

        Ok((stream, device_rate))
    }
}

/// Capture handles F32 and I16 samples only.
fn check_sample_format(format: SampleFormat) -> VoiceResult<()> {
    match format {
        SampleFormat::F32 | SampleFormat::I16 => Ok(()),
        other => Err(VoiceError::AudioDevice(format!(
            "unsupported microphone sample format {:?} (need F32 or I16)",
            other
        ))),
    }
}

impl AudioInputSource for MicrophoneSource {
    fn acquire(&mut self) -> VoiceResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::PermissionDenied("No input device available".to_string()))?;

        info!("🎤 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

        let (stream, device_rate) = self.build_stream(&device)?;
        stream.play()?;
        self.stream = Some(stream);
        self.device_rate = device_rate;

        info!(device_rate, "✅ Microphone capture started");
        Ok(())
    }

    fn tap(&self) -> VoiceResult<Box<dyn AmplitudeReader>> {
        if self.stream.is_none() {
            return Err(VoiceError::AudioDevice("microphone not acquired".to_string()));
        }
        let analyser = SpectrumAnalyser::new(self.config.analyser.clone());
        Ok(Box::new(AnalyserTap {
            window: Arc::clone(&self.window),
            scratch: Vec::with_capacity(analyser.fft_size()),
            analyser,
        }))
    }

    fn start_encoder(&mut self, sink: ChunkSink) -> VoiceResult<()> {
        if self.stream.is_none() {
            return Err(VoiceError::EncoderUnavailable("microphone not acquired".to_string()));
        }
        let mut slot = self
            .encoder
            .lock()
            .map_err(|_| VoiceError::EncoderUnavailable("encoder lock poisoned".to_string()))?;
        if slot.is_some() {
            return Err(VoiceError::EncoderUnavailable("encoder already running".to_string()));
        }
        *slot = Some(WavStreamEncoder::start(
            sink,
            self.device_rate,
            self.config.sample_rate,
            self.config.encoder_frame,
        )?);
        Ok(())
    }

    fn stop_encoder(&mut self) {
        let encoder = match self.encoder.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(encoder) = encoder {
            encoder.finish();
        }
    }

    fn release(&mut self) {
        self.stop_encoder();
        if self.stream.take().is_some() {
            info!("⏹️ Microphone released");
        }
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// State moved into the capture callback.
struct CaptureSink {
    window: Arc<Mutex<SampleWindow>>,
    encoder: Arc<Mutex<Option<WavStreamEncoder>>>,
    channels: usize,
}

impl CaptureSink {
    fn new(source: &MicrophoneSource, channels: usize) -> Self {
        Self {
            window: Arc::clone(&source.window),
            encoder: Arc::clone(&source.encoder),
            channels,
        }
    }

    fn accept(&self, data: &[f32]) {
        let mono = downmix(data, self.channels);
        // a reader mid-copy costs the meter one buffer, never the recording
        if let Ok(mut window) = self.window.try_lock() {
            window.push(&mono);
        }
        if let Ok(mut slot) = self.encoder.lock() {
            if let Some(encoder) = slot.as_mut() {
                encoder.push(&mono);
            }
        }
    }
}

/// Average interleaved channels into mono.
fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => samples
            .chunks_exact(n)
            .map(|frame| frame.iter().sum::<f32>() / n as f32)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microphone_config_defaults() {
        let config = MicrophoneConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.encoder_frame, Duration::from_millis(250));
        assert_eq!(config.analyser.fft_size, 512);
    }

    #[test]
    fn header_is_streaming_pcm16_mono() {
        let header = wav_stream_header(16000);
        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes([header[24], header[25], header[26], header[27]]), 16000);
        assert_eq!(&header[36..40], b"data");
        assert_eq!(&header[40..44], &u32::MAX.to_le_bytes());
    }

    #[test]
    fn encoder_emits_header_then_full_frames_then_remainder() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // 10ms frames at 1kHz = 10 samples = 20 bytes
        let mut encoder =
            WavStreamEncoder::start(tx, 1000, 1000, Duration::from_millis(10)).unwrap();
        encoder.push(&[0.5; 25]);
        encoder.finish();

        let chunks: Vec<Vec<u8>> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![44, 20, 20, 10]);
        assert_eq!(&chunks[1][0..2], &16384i16.to_le_bytes());
        // sink dropped after finish
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, 0.0, 1.0, 0.25, 0.25];
        assert_eq!(downmix(&stereo, 2), vec![0.5, 0.5, 0.5, 0.25]);
        assert_eq!(downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
        assert!(downmix(&[0.1, 0.2], 0).is_empty());
    }

    /// One second captured at `device_rate` in odd-sized callback buffers.
    fn encoded_pcm_bytes(device_rate: u32, buffer: usize) -> usize {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut encoder =
            WavStreamEncoder::start(tx, device_rate, 16000, Duration::from_millis(250)).unwrap();
        let second: Vec<f32> = (0..device_rate)
            .map(|i| 0.3 * (i as f32 * 0.05).sin())
            .collect();
        for piece in second.chunks(buffer) {
            encoder.push(piece);
        }
        encoder.finish();

        let chunks: Vec<Vec<u8>> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(chunks[0], wav_stream_header(16000));
        chunks[1..].iter().map(Vec::len).sum()
    }

    #[test]
    fn encoded_duration_matches_capture_at_48k() {
        assert_eq!(encoded_pcm_bytes(48_000, 441), 16_000 * 2);
    }

    #[test]
    fn encoded_duration_matches_capture_at_44_1k() {
        assert_eq!(encoded_pcm_bytes(44_100, 441), 16_000 * 2);
    }

    #[test]
    fn capture_never_waits_on_the_level_reader() {
        let mic = MicrophoneSource::new(MicrophoneConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        *mic.encoder.lock().unwrap() =
            Some(WavStreamEncoder::start(tx, 16000, 16000, Duration::from_millis(10)).unwrap());
        let sink = CaptureSink::new(&mic, 2);
        // stereo, both channels carrying the same tone
        let loud: Vec<f32> = (0..640).map(|i| 0.4 * ((i / 2) as f32 * 0.3).sin()).collect();

        {
            // reader mid-copy: the buffer misses the meter but still reaches the encoder
            let _held = mic.window.lock().unwrap();
            sink.accept(&loud);
        }
        let mut tap = AnalyserTap {
            window: Arc::clone(&mic.window),
            analyser: SpectrumAnalyser::new(AnalyserConfig::default()),
            scratch: Vec::new(),
        };
        assert_eq!(tap.level(), 0.0);

        sink.accept(&loud);
        assert!(tap.level() > 0.0);

        let chunks: Vec<Vec<u8>> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        // header plus 2 x 320 mono samples in 160-sample frames
        assert_eq!(chunks.len(), 1 + 4);
    }

    #[test]
    fn only_f32_and_i16_capture_is_supported() {
        assert!(check_sample_format(SampleFormat::F32).is_ok());
        assert!(check_sample_format(SampleFormat::I16).is_ok());
        let err = check_sample_format(SampleFormat::U8).unwrap_err();
        assert!(matches!(err, VoiceError::AudioDevice(_)));
        assert!(!err.is_user_visible());
    }

    #[test]
    fn tap_and_encoder_require_acquisition() {
        let mut mic = MicrophoneSource::new(MicrophoneConfig::default());
        assert!(!mic.is_acquired());
        assert!(mic.tap().is_err());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(mic.start_encoder(tx), Err(VoiceError::EncoderUnavailable(_))));
        // releasing an unacquired source is harmless
        mic.release();
        mic.release();
    }

    #[test]
    fn test_list_devices() {
        // This might fail in CI environments without audio devices
        if let Ok(devices) = MicrophoneSource::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }
}

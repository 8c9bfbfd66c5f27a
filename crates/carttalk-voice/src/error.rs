//! Error types for the CartTalk call client

use thiserror::Error;

/// Result type alias for call operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a call
#[derive(Error, Debug)]
pub enum VoiceError {
    /// No microphone access (user declined or no device). The call cannot proceed.
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    /// Connection drop or send failure on the streaming channel.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Reply decode or output device failure. Recovered by resuming listening.
    #[error("Audio playback error: {0}")]
    Playback(String),

    /// Unparseable text frame from the peer. Dropped.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The frame encoder could not be started for a new utterance.
    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Call bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Only a missing microphone is surfaced to the user; everything else is
    /// recovered inside the session.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, VoiceError::PermissionDenied(_))
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

// A device that vanished or refused to open counts as denied access; a device that
// is there but cannot run the requested stream is a device or stream fault.

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                VoiceError::PermissionDenied(err.to_string())
            }
            other => VoiceError::AudioDevice(other.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => VoiceError::PermissionDenied(err.to_string()),
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => VoiceError::PermissionDenied(err.to_string()),
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

impl From<rubato::ResamplerConstructionError> for VoiceError {
    fn from(err: rubato::ResamplerConstructionError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Channel(err.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Bootstrap(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::MalformedMessage(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

//! # CartTalk Voice - Hands-free Call Sessions
//!
//! This crate runs the client side of a spoken conversation with a remote voice
//! agent: it listens to the microphone, decides locally when the user starts and
//! stops talking, ships each utterance over a duplex stream and plays the agent's
//! synthesized reply, looping until the call ends.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Call Session                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │   Audio In   │→ │  Spectrum +  │→ │    Utterance     │   │
//! │  │    (cpal)    │  │  VAD (1.5s)  │  │ Recorder (WAV)   │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! │                                               ↓              │
//! │  ┌──────────────┐   binary reply    ┌──────────────────┐   │
//! │  │  Audio Out   │←──────────────────│  Stream Channel  │   │
//! │  │   (rodio)    │   JSON transcript │   (WebSocket)    │   │
//! │  └──────────────┘                   └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod recorder;
pub mod resample;
pub mod session;
pub mod spectrum;
pub mod transport;
pub mod vad;

pub use audio::{AmplitudeReader, AudioInputSource, ChunkSink, MicrophoneConfig, MicrophoneSource};
pub use bootstrap::{CallBootstrap, CallTicket};
pub use config::CallConfig;
pub use error::{VoiceError, VoiceResult};
pub use playback::{PlaybackController, PlaybackOutcome, PlaybackTicket, RodioPlayback};
pub use protocol::{ChatTurn, Inbound, Reply, Role, WireFrame};
pub use recorder::{Utterance, UtteranceRecorder};
pub use session::{
    CallHandle, CallSession, CallState, CallSummary, EndReason, SessionConfig, SessionEvent,
};
pub use resample::MonoResampler;
pub use spectrum::{AnalyserConfig, SampleWindow, SpectrumAnalyser};
pub use transport::{CallTransport, WsTransport};
pub use vad::{VadConfig, VadEvent, VadState, VoiceActivityDetector};

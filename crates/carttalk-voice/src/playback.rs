//! **Playback**: plays agent replies through the default output device.
//!
//! `play` returns a ticket that resolves when the reply has finished. The caller
//! (the session state machine) guarantees only one reply plays at a time; the
//! controller does not guard against overlapping calls itself.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::Reply;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::io::Cursor;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// How a playback ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Failed(String),
}

/// Resolves once when the reply stops playing. A dropped sender (playback torn
/// down) reads as an error on the receiver.
pub type PlaybackTicket = oneshot::Receiver<PlaybackOutcome>;

pub trait PlaybackController {
    /// Decode and start playing `reply`. Decode or device failures are returned
    /// immediately as `VoiceError::Playback`.
    fn play(&mut self, reply: Reply) -> VoiceResult<PlaybackTicket>;

    /// Halt playback now. Idempotent, also when nothing is playing.
    fn stop(&mut self);
}

/// Rodio-backed controller. The output device is opened on first use.
#[derive(Default)]
pub struct RodioPlayback {
    output: Option<(OutputStream, OutputStreamHandle)>,
    sink: Option<Sink>,
}

impl RodioPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a reply is currently queued or playing.
    pub fn is_playing(&self) -> bool {
        self.sink.as_ref().map(|s| !s.empty()).unwrap_or(false)
    }

    fn handle(&mut self) -> VoiceResult<&OutputStreamHandle> {
        if self.output.is_none() {
            let (stream, handle) =
                OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
            info!("🔊 Audio output initialized");
            self.output = Some((stream, handle));
        }
        match self.output.as_ref() {
            Some((_, handle)) => Ok(handle),
            None => Err(VoiceError::Playback("output device unavailable".to_string())),
        }
    }
}

impl PlaybackController for RodioPlayback {
    fn play(&mut self, reply: Reply) -> VoiceResult<PlaybackTicket> {
        let source = rodio::Decoder::new(Cursor::new(reply.payload))
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;

        let sink = Sink::try_new(self.handle()?).map_err(|e| VoiceError::Playback(e.to_string()))?;

        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = Mutex::new(Some(done_tx));
        sink.append(source);
        sink.append(rodio::source::EmptyCallback::<f32>::new(Box::new(move || {
            if let Some(tx) = done_tx.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = tx.send(PlaybackOutcome::Completed);
            }
        })));

        debug!(mime = reply.mime, "reply playback started");
        self.sink = Some(sink);
        Ok(done_rx)
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
            info!("⏹️ Reply playback stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undecodable_reply_fails_before_touching_output() {
        let mut playback = RodioPlayback::new();
        let err = playback.play(Reply::new(b"definitely not audio".to_vec())).unwrap_err();
        assert!(matches!(err, VoiceError::Playback(_)));
        assert!(!playback.is_playing());
    }

    #[test]
    fn stop_without_playback_is_harmless() {
        let mut playback = RodioPlayback::new();
        playback.stop();
        playback.stop();
        assert!(!playback.is_playing());
    }
}

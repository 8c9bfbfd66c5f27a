//! Utterance recording: buffers encoded chunks between speech start and speech end.
//!
//! One recorder lives for the whole call and runs a begin/finish cycle per utterance.
//! Chunks flow from the input source's encoder through an unbounded channel; `finish`
//! stops the encoder first (which flushes synchronously) and then drains the channel,
//! so every chunk captured in the window ends up in the payload, in arrival order.

use crate::audio::{AudioInputSource, UTTERANCE_MIME};
use crate::error::{VoiceError, VoiceResult};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A finished utterance, ready for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub payload: Vec<u8>,
    pub mime: &'static str,
    /// Number of non-empty chunks concatenated into `payload`.
    pub chunks: usize,
}

impl Utterance {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

pub struct UtteranceRecorder {
    chunks: Vec<Vec<u8>>,
    chunk_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    mime: &'static str,
}

impl Default for UtteranceRecorder {
    fn default() -> Self {
        Self::new(UTTERANCE_MIME)
    }
}

impl UtteranceRecorder {
    pub fn new(mime: &'static str) -> Self {
        Self {
            chunks: Vec::new(),
            chunk_rx: None,
            mime,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.chunk_rx.is_some()
    }

    /// Start buffering chunks from `source`. No-op while already recording.
    pub fn begin(&mut self, source: &mut dyn AudioInputSource) -> VoiceResult<()> {
        if self.is_recording() {
            debug!("recorder already running, ignoring begin");
            return Ok(());
        }
        self.chunks.clear();
        let (tx, rx) = mpsc::unbounded_channel();
        source.start_encoder(tx).map_err(|e| match e {
            VoiceError::EncoderUnavailable(_) => e,
            other => VoiceError::EncoderUnavailable(other.to_string()),
        })?;
        self.chunk_rx = Some(rx);
        debug!("utterance recording started");
        Ok(())
    }

    /// Add one encoded chunk. Zero-size chunks, and chunks arriving while idle, are dropped.
    pub fn append_chunk(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        if !self.is_recording() {
            trace!(len = data.len(), "chunk outside an utterance dropped");
            return;
        }
        self.chunks.push(data);
    }

    /// Move chunks already delivered by the encoder into the buffer.
    pub fn pump(&mut self) {
        let mut drained = Vec::new();
        if let Some(rx) = self.chunk_rx.as_mut() {
            while let Ok(chunk) = rx.try_recv() {
                drained.push(chunk);
            }
        }
        for chunk in drained {
            self.append_chunk(chunk);
        }
    }

    /// Stop capture and return the concatenated payload. `None` when not recording.
    pub fn finish(&mut self, source: &mut dyn AudioInputSource) -> Option<Utterance> {
        if !self.is_recording() {
            return None;
        }
        source.stop_encoder();
        self.pump();
        self.chunk_rx = None;

        let chunks = std::mem::take(&mut self.chunks);
        let count = chunks.len();
        let payload = chunks.concat();
        debug!(chunks = count, bytes = payload.len(), "utterance finished");
        Some(Utterance {
            payload,
            mime: self.mime,
            chunks: count,
        })
    }

    /// Stop capture and throw away the unfinished utterance. Idempotent.
    pub fn discard(&mut self, source: &mut dyn AudioInputSource) {
        if self.chunk_rx.take().is_some() {
            source.stop_encoder();
            debug!(chunks = self.chunks.len(), "unfinished utterance discarded");
        }
        self.chunks.clear();
    }
}

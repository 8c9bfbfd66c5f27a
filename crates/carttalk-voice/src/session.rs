//! Call Session - the protocol engine of one hands-free call
//!
//! A single event loop owns every piece of session state: the detector, the
//! recorder, the microphone, the channel and playback. Each loop iteration waits
//! on exactly one of
//! - a command from a [`CallHandle`] (hang up)
//! - the next inbound frame, in arrival order
//! - completion of the reply that is playing
//! - the VAD hangover deadline
//! - the bounded reply wait
//! - the next polling tick (only while the detector polls)
//!
//! and then runs the matching handler to completion, so no two handlers ever
//! interleave and no locks guard the state.
//!
//! ```text
//!   Initializing ──open──▶ Listening ──speechStart──▶ SpeechDetected
//!                            ▲   ▲                          │ speechEnd
//!            empty frame /   │   │                          ▼
//!            reply timeout   │   └──── playback done ──── Processing
//!                            │                              │ reply
//!                            └──────── PeerSpeaking ◀───────┘
//!                                     (any) ──hangup/close──▶ Closed
//! ```

use crate::audio::{AmplitudeReader, AudioInputSource};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{PlaybackController, PlaybackOutcome, PlaybackTicket};
use crate::protocol::{ChatTurn, Inbound, WireFrame};
use crate::recorder::UtteranceRecorder;
use crate::transport::CallTransport;
use crate::vad::{VadConfig, VadEvent, VoiceActivityDetector};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Session tunables
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub vad: VadConfig,

    /// Amplitude sampling period while the detector polls
    pub poll_interval: Duration,

    /// Longest wait in `Processing` before falling back to `Listening`.
    /// `None` waits for the peer indefinitely.
    pub reply_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            poll_interval: Duration::from_millis(16),
            reply_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Where the call is in its listen/speak cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Initializing,
    Listening,
    SpeechDetected,
    Processing,
    PeerSpeaking,
    Closed,
}

impl CallState {
    /// Status line shown to the user.
    pub fn label(&self) -> &'static str {
        match self {
            CallState::Initializing => "Connecting...",
            CallState::Listening => "Listening...",
            CallState::SpeechDetected => "User Speaking...",
            CallState::Processing => "Thinking...",
            CallState::PeerSpeaking => "Agent Speaking...",
            CallState::Closed => "Call Ended",
        }
    }

    /// States in which the microphone feeds an utterance to the peer.
    pub fn is_capturing(&self) -> bool {
        matches!(self, CallState::SpeechDetected | CallState::Processing)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why the call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Hangup,
    PeerClosed,
    ChannelError(String),
}

/// Published on the session's event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: CallState, to: CallState },
    Turn(ChatTurn),
    UtteranceSent { bytes: usize },
    Ended { reason: EndReason },
}

/// Outcome of a finished call.
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub call_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: EndReason,
    pub turns: Vec<ChatTurn>,
    pub utterances_sent: usize,
}

#[derive(Debug)]
enum CallCommand {
    Hangup,
}

/// Remote control for a running session. Dropping every handle does not end the call.
#[derive(Debug, Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<CallCommand>,
}

impl CallHandle {
    /// Ask the session to end the call. Returns false once the session is gone.
    pub fn hangup(&self) -> bool {
        self.tx.send(CallCommand::Hangup).is_ok()
    }
}

enum Event {
    Command(CallCommand),
    Frame(Option<VoiceResult<WireFrame>>),
    PlaybackDone(PlaybackOutcome),
    Hangover,
    ReplyTimeout,
    Tick,
}

pub struct CallSession {
    call_id: String,
    config: SessionConfig,
    state: CallState,

    source: Box<dyn AudioInputSource>,
    tap: Option<Box<dyn AmplitudeReader>>,
    transport: Box<dyn CallTransport>,
    playback: Box<dyn PlaybackController>,

    vad: VoiceActivityDetector,
    recorder: UtteranceRecorder,
    playing: Option<PlaybackTicket>,
    reply_deadline: Option<Instant>,
    // Replies still owed for utterances whose wait timed out.
    stale_replies: usize,

    turns: Vec<ChatTurn>,
    utterances_sent: usize,

    commands: mpsc::UnboundedReceiver<CallCommand>,
    // Keeps `commands` open after every external handle is dropped.
    _command_tx: mpsc::UnboundedSender<CallCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        config: SessionConfig,
        source: Box<dyn AudioInputSource>,
        transport: Box<dyn CallTransport>,
        playback: Box<dyn PlaybackController>,
    ) -> (Self, CallHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let vad = VoiceActivityDetector::new(config.vad.clone());

        let session = Self {
            call_id: call_id.into(),
            config,
            state: CallState::Initializing,
            source,
            tap: None,
            transport,
            playback,
            vad,
            recorder: UtteranceRecorder::default(),
            playing: None,
            reply_deadline: None,
            stale_replies: 0,
            turns: Vec::new(),
            utterances_sent: 0,
            commands,
            _command_tx: command_tx.clone(),
            events,
            event_rx: Some(event_rx),
        };
        (session, CallHandle { tx: command_tx })
    }

    /// The session's event stream. Available once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    /// Drive the call until it ends. The channel is expected to be open already.
    ///
    /// Only a microphone failure is returned as an error; every other failure ends
    /// or recovers the call and is reported through [`CallSummary::end_reason`].
    pub async fn run(mut self) -> VoiceResult<CallSummary> {
        let started_at = Utc::now();
        info!(target: "carttalk::call", call_id = %self.call_id, "📞 Call session starting");

        if let Err(e) = self.open_microphone() {
            error!(target: "carttalk::call", "Microphone unavailable: {}", e);
            let notice = match &e {
                VoiceError::PermissionDenied(_) => "Microphone access denied".to_string(),
                other => format!("Microphone unavailable: {}", other),
            };
            self.push_turn(ChatTurn::system(notice));
            self.teardown().await;
            self.set_state(CallState::Closed);
            return Err(e);
        }

        let vad = self.vad.config();
        debug!(
            target: "carttalk::call",
            threshold = vad.threshold,
            hangover_ms = vad.hangover.as_millis() as u64,
            "VAD armed"
        );
        self.resume_listening();

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let end_reason = loop {
            let event = self.next_event(&mut ticker).await;
            if let Some(reason) = self.handle(event).await {
                break reason;
            }
        };

        match &end_reason {
            EndReason::ChannelError(e) => {
                error!(target: "carttalk::call", call_id = %self.call_id, "Channel error: {}", e)
            }
            reason => info!(target: "carttalk::call", call_id = %self.call_id, ?reason, "Call ending"),
        }
        self.teardown().await;
        self.set_state(CallState::Closed);
        self.emit(SessionEvent::Ended {
            reason: end_reason.clone(),
        });

        Ok(CallSummary {
            call_id: self.call_id.clone(),
            started_at,
            ended_at: Utc::now(),
            end_reason,
            turns: std::mem::take(&mut self.turns),
            utterances_sent: self.utterances_sent,
        })
    }

    fn open_microphone(&mut self) -> VoiceResult<()> {
        self.source.acquire()?;
        self.tap = Some(self.source.tap()?);
        info!(target: "carttalk::call", "🎤 Microphone acquired");
        Ok(())
    }

    async fn next_event(&mut self, ticker: &mut tokio::time::Interval) -> Event {
        let hangover = self.vad.hangover_deadline();
        let reply_deadline = self.reply_deadline;
        let polling = self.vad.is_polling();
        let awaiting_playback = self.playing.is_some();
        let Self {
            commands,
            transport,
            playing,
            ..
        } = self;

        tokio::select! {
            biased;
            Some(command) = commands.recv() => Event::Command(command),
            frame = transport.next_frame() => Event::Frame(frame),
            outcome = playback_finished(playing), if awaiting_playback => Event::PlaybackDone(outcome),
            _ = sleep_until(hangover), if hangover.is_some() => Event::Hangover,
            _ = sleep_until(reply_deadline), if reply_deadline.is_some() => Event::ReplyTimeout,
            _ = ticker.tick(), if polling => Event::Tick,
        }
    }

    /// Run one handler. Returns the reason when the call must end.
    async fn handle(&mut self, event: Event) -> Option<EndReason> {
        match event {
            Event::Command(CallCommand::Hangup) => Some(EndReason::Hangup),
            Event::Frame(None) => Some(EndReason::PeerClosed),
            Event::Frame(Some(Err(e))) => Some(EndReason::ChannelError(e.to_string())),
            Event::Frame(Some(Ok(frame))) => {
                self.on_frame(frame);
                None
            }
            Event::PlaybackDone(outcome) => {
                self.playing = None;
                if let PlaybackOutcome::Failed(e) = outcome {
                    warn!(target: "carttalk::call", "Reply playback failed: {}", e);
                }
                if self.state == CallState::PeerSpeaking {
                    self.resume_listening();
                }
                None
            }
            Event::Hangover => match self.vad.expire(Instant::now()) {
                Some(vad_event) => self.on_vad(vad_event).await,
                None => None,
            },
            Event::ReplyTimeout => {
                self.reply_deadline = None;
                if self.state == CallState::Processing {
                    // the peer still answers this utterance eventually
                    self.stale_replies += 1;
                    warn!(target: "carttalk::call", "No reply from peer in time, listening again");
                    self.resume_listening();
                }
                None
            }
            Event::Tick => {
                if self.recorder.is_recording() {
                    self.recorder.pump();
                }
                let level = self.tap.as_mut().map(|tap| tap.level()).unwrap_or(0.0);
                match self.vad.observe(level, Instant::now()) {
                    Some(vad_event) => self.on_vad(vad_event).await,
                    None => None,
                }
            }
        }
    }

    async fn on_vad(&mut self, event: VadEvent) -> Option<EndReason> {
        match (event, self.state) {
            (VadEvent::SpeechStart, CallState::Listening) => {
                match self.recorder.begin(self.source.as_mut()) {
                    Ok(()) => self.set_state(CallState::SpeechDetected),
                    Err(e) => warn!(target: "carttalk::call", "Cannot record utterance: {}", e),
                }
                None
            }
            (VadEvent::SpeechEnd, CallState::SpeechDetected) => self.send_utterance().await,
            (VadEvent::SpeechEnd, CallState::Listening) => {
                // speech that could not be recorded
                self.vad.start();
                None
            }
            (event, state) => {
                debug!(?event, ?state, "VAD event ignored");
                None
            }
        }
    }

    async fn send_utterance(&mut self) -> Option<EndReason> {
        self.vad.stop();
        let utterance = match self.recorder.finish(self.source.as_mut()) {
            Some(utterance) if !utterance.is_empty() => utterance,
            _ => {
                warn!(target: "carttalk::call", "Utterance produced no audio, not sending");
                self.resume_listening();
                return None;
            }
        };

        self.set_state(CallState::Processing);
        let bytes = utterance.len();
        if let Err(e) = self.transport.send_utterance(utterance.payload).await {
            return Some(EndReason::ChannelError(e.to_string()));
        }

        self.utterances_sent += 1;
        info!(
            target: "carttalk::call",
            bytes,
            chunks = utterance.chunks,
            mime = utterance.mime,
            "📤 Utterance sent"
        );
        self.emit(SessionEvent::UtteranceSent { bytes });
        self.reply_deadline = self.config.reply_timeout.map(|t| Instant::now() + t);
        None
    }

    fn on_frame(&mut self, frame: WireFrame) {
        match Inbound::decode(frame) {
            Inbound::Transcript(turn) => self.push_turn(turn),
            Inbound::Ignored(reason) => debug!("Ignored control frame: {}", reason),
            Inbound::NoReply | Inbound::Reply(_) if self.stale_replies > 0 => {
                self.stale_replies -= 1;
                debug!(
                    target: "carttalk::call",
                    pending = self.stale_replies,
                    "Late answer to a timed-out utterance dropped"
                );
            }
            Inbound::NoReply if self.state == CallState::Processing => {
                debug!(target: "carttalk::call", "Peer has no reply");
                self.resume_listening();
            }
            Inbound::Reply(reply) if self.state == CallState::Processing => {
                self.reply_deadline = None;
                let bytes = reply.payload.len();
                match self.playback.play(reply) {
                    Ok(ticket) => {
                        info!(target: "carttalk::call", bytes, "🔊 Playing reply");
                        self.playing = Some(ticket);
                        self.set_state(CallState::PeerSpeaking);
                    }
                    Err(e) => {
                        warn!(target: "carttalk::call", "Reply playback failed: {}", e);
                        self.resume_listening();
                    }
                }
            }
            Inbound::NoReply | Inbound::Reply(_) => {
                debug!(state = ?self.state, "Audio frame outside Processing dropped");
            }
        }
    }

    fn resume_listening(&mut self) {
        self.reply_deadline = None;
        self.vad.start();
        self.set_state(CallState::Listening);
    }

    fn push_turn(&mut self, turn: ChatTurn) {
        info!(target: "carttalk::call", "💬 {}", turn);
        self.turns.push(turn.clone());
        self.emit(SessionEvent::Turn(turn));
    }

    fn set_state(&mut self, to: CallState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!(target: "carttalk::call", ?from, ?to, "{}", to.label());
        self.emit(SessionEvent::StateChanged { from, to });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Close the channel, drop any unfinished utterance, halt playback, release the
    /// microphone, cancel the hangover timer. Safe to run more than once.
    async fn teardown(&mut self) {
        self.transport.close().await;
        self.recorder.discard(self.source.as_mut());
        self.playing = None;
        self.playback.stop();
        self.tap = None;
        self.source.release();
        self.vad.stop();
        self.reply_deadline = None;
    }
}

async fn playback_finished(ticket: &mut Option<PlaybackTicket>) -> PlaybackOutcome {
    match ticket.as_mut() {
        Some(rx) => rx
            .await
            .unwrap_or_else(|_| PlaybackOutcome::Failed("playback dropped".to_string())),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

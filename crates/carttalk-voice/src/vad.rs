//! Voice activity detection with a threshold-plus-hangover rule.
//!
//! The detector is driven by its owner: every polling tick hands it the current
//! amplitude sample, and the owner arms a timer for [`VoiceActivityDetector::hangover_deadline`].
//! Speech starts as soon as a sample exceeds the threshold; speech ends only after
//! the signal has stayed at or below the threshold for the whole hangover period.
//! After `SpeechEnd` the detector stops polling until [`VoiceActivityDetector::start`]
//! is called again.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Configuration for the detector
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// Mean spectral energy (0-255 scale) that counts as speech (default: 15)
    pub threshold: f32,

    /// Silence needed before speech is considered finished (default: 1500ms)
    pub hangover: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 15.0,
            hangover: Duration::from_millis(1500),
        }
    }
}

/// Events emitted at speech boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    SpeechEnd,
}

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Idle,
    Active,
}

pub struct VoiceActivityDetector {
    config: VadConfig,
    state: VadState,
    polling: bool,
    hangover_deadline: Option<Instant>,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: VadState::Idle,
            polling: false,
            hangover_deadline: None,
        }
    }

    /// (Re)start polling from a clean `Idle` state.
    pub fn start(&mut self) {
        self.state = VadState::Idle;
        self.hangover_deadline = None;
        self.polling = true;
        debug!("VAD polling started");
    }

    /// Stop polling and cancel any pending hangover timer. Idempotent.
    pub fn stop(&mut self) {
        self.polling = false;
        self.hangover_deadline = None;
    }

    /// Feed one amplitude sample taken at `now`.
    pub fn observe(&mut self, level: f32, now: Instant) -> Option<VadEvent> {
        if !self.polling {
            return None;
        }

        // A hangover that already ran out ends the utterance before this sample counts.
        if let Some(event) = self.expire(now) {
            return Some(event);
        }

        let loud = level > self.config.threshold;
        match (self.state, loud) {
            (VadState::Idle, true) => {
                debug!(level, "speech start");
                self.state = VadState::Active;
                self.hangover_deadline = None;
                Some(VadEvent::SpeechStart)
            }
            (VadState::Active, true) => {
                self.hangover_deadline = None;
                None
            }
            (VadState::Active, false) => {
                if self.hangover_deadline.is_none() {
                    self.hangover_deadline = Some(now + self.config.hangover);
                }
                None
            }
            (VadState::Idle, false) => None,
        }
    }

    /// Fire the hangover timer if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<VadEvent> {
        match self.hangover_deadline {
            Some(deadline) if now >= deadline && self.state == VadState::Active => {
                debug!("hangover elapsed, speech end");
                self.state = VadState::Idle;
                self.hangover_deadline = None;
                self.polling = false;
                Some(VadEvent::SpeechEnd)
            }
            _ => None,
        }
    }

    /// When the pending hangover timer fires, if one is running.
    pub fn hangover_deadline(&self) -> Option<Instant> {
        self.hangover_deadline
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives the detector over `(duration, level)` segments at a fixed tick,
    /// firing the hangover timer at its exact deadline like a real timer would.
    fn run(
        segments: &[(u64, f32)],
        tick_ms: u64,
        config: VadConfig,
    ) -> Vec<(VadEvent, Duration)> {
        let origin = Instant::now();
        let mut vad = VoiceActivityDetector::new(config);
        vad.start();

        let mut events = Vec::new();
        let mut elapsed = 0u64;
        for &(duration, level) in segments {
            let end = elapsed + duration;
            while elapsed < end {
                let now = origin + Duration::from_millis(elapsed);
                if let Some(deadline) = vad.hangover_deadline() {
                    if deadline <= now {
                        if let Some(ev) = vad.expire(deadline) {
                            events.push((ev, deadline - origin));
                        }
                    }
                }
                if let Some(ev) = vad.observe(level, now) {
                    events.push((ev, now - origin));
                }
                elapsed += tick_ms;
            }
        }
        if let Some(deadline) = vad.hangover_deadline() {
            if let Some(ev) = vad.expire(deadline) {
                events.push((ev, deadline - origin));
            }
        }
        events
    }

    #[test]
    fn defaults() {
        let config = VadConfig::default();
        assert_eq!(config.threshold, 15.0);
        assert_eq!(config.hangover, Duration::from_millis(1500));
    }

    #[test]
    fn speech_then_silence_yields_one_start_and_one_end() {
        // 5,5 | 20,22,20 | 1600ms of 4s, at 100ms per sample
        let segments = [(200, 5.0), (100, 20.0), (100, 22.0), (100, 20.0), (1600, 4.0)];
        let events = run(&segments, 100, VadConfig::default());

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], (VadEvent::SpeechStart, Duration::from_millis(200)));
        assert_eq!(events[1].0, VadEvent::SpeechEnd);
        // energy dropped at 500ms
        assert_eq!(events[1].1, Duration::from_millis(2000));
    }

    #[test]
    fn boundaries_do_not_depend_on_tick_rate() {
        let segments = [(300, 2.0), (900, 40.0), (2000, 3.0)];
        for tick in [5, 10, 16, 33, 50] {
            let events = run(&segments, tick, VadConfig::default());
            let kinds: Vec<_> = events.iter().map(|(e, _)| *e).collect();
            assert_eq!(kinds, vec![VadEvent::SpeechStart, VadEvent::SpeechEnd], "tick {tick}ms");
        }
    }

    #[test]
    fn short_gap_is_absorbed_by_hangover() {
        let segments = [(400, 30.0), (1000, 2.0), (400, 30.0), (1600, 2.0)];
        let events = run(&segments, 10, VadConfig::default());
        // only the trailing silence produces an end
        let ends = events.iter().filter(|(e, _)| *e == VadEvent::SpeechEnd).count();
        let starts = events.iter().filter(|(e, _)| *e == VadEvent::SpeechStart).count();
        assert_eq!(starts, 1);
        assert_eq!(ends, 1);
        // and it comes after the second burst, not during the gap
        assert!(events[1].1 >= Duration::from_millis(1800));
    }

    #[test]
    fn sample_equal_to_threshold_counts_as_silence() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.start();
        let now = Instant::now();
        assert_eq!(vad.observe(15.0, now), None);
        assert_eq!(vad.state(), VadState::Idle);
        assert_eq!(vad.observe(15.1, now), Some(VadEvent::SpeechStart));
        assert_eq!(vad.observe(15.0, now), None);
        assert!(vad.hangover_deadline().is_some());
    }

    #[test]
    fn loud_sample_cancels_pending_hangover() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.start();
        let t0 = Instant::now();
        vad.observe(50.0, t0);
        vad.observe(1.0, t0 + Duration::from_millis(100));
        assert!(vad.hangover_deadline().is_some());
        vad.observe(50.0, t0 + Duration::from_millis(200));
        assert!(vad.hangover_deadline().is_none());
    }

    #[test]
    fn stops_polling_after_speech_end() {
        let mut vad = VoiceActivityDetector::new(VadConfig {
            threshold: 10.0,
            hangover: Duration::from_millis(100),
        });
        vad.start();
        let t0 = Instant::now();
        vad.observe(20.0, t0);
        vad.observe(0.0, t0);
        assert_eq!(
            vad.expire(t0 + Duration::from_millis(100)),
            Some(VadEvent::SpeechEnd)
        );
        assert!(!vad.is_polling());
        // loud input is ignored until the owner restarts polling
        assert_eq!(vad.observe(99.0, t0 + Duration::from_millis(150)), None);
        vad.start();
        assert_eq!(
            vad.observe(99.0, t0 + Duration::from_millis(200)),
            Some(VadEvent::SpeechStart)
        );
    }

    #[test]
    fn late_tick_after_deadline_ends_speech_first() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.start();
        let t0 = Instant::now();
        vad.observe(30.0, t0);
        vad.observe(1.0, t0 + Duration::from_millis(10));
        // timer should have fired at 1510ms; a loud sample at 1600ms does not revive speech
        assert_eq!(
            vad.observe(30.0, t0 + Duration::from_millis(1600)),
            Some(VadEvent::SpeechEnd)
        );
        assert!(!vad.is_polling());
    }

    #[test]
    fn stop_cancels_hangover() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.start();
        let t0 = Instant::now();
        vad.observe(30.0, t0);
        vad.observe(1.0, t0);
        vad.stop();
        vad.stop();
        assert!(vad.hangover_deadline().is_none());
        assert_eq!(vad.expire(t0 + Duration::from_secs(5)), None);
    }
}

//! Sample-rate conversion from the device rate to the utterance rate.
//!
//! The capture callback hands over buffers of whatever size the backend picks, so
//! input is queued until a full resampler chunk is available. The filter delay is
//! trimmed from the head and [`MonoResampler::flush`] drains the tail, so one
//! second in is one second out.

use crate::error::VoiceResult;
use rubato::{FftFixedIn, Resampler};
use tracing::warn;

/// Input frames per resampler chunk; rounded up by rubato to a whole ratio multiple.
const CHUNK_FRAMES: usize = 1024;
const SUB_CHUNKS: usize = 2;

/// Stateful mono resampler. A pass-through when both rates match.
pub struct MonoResampler {
    inner: Option<FftFixedIn<f32>>,
    from_rate: u32,
    to_rate: u32,
    pending: Vec<f32>,
    delay_left: usize,
    consumed: u64,
    produced: u64,
}

impl MonoResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> VoiceResult<Self> {
        let inner = if from_rate == to_rate {
            None
        } else {
            Some(FftFixedIn::<f32>::new(
                from_rate as usize,
                to_rate as usize,
                CHUNK_FRAMES,
                SUB_CHUNKS,
                1,
            )?)
        };
        let delay_left = inner.as_ref().map(|r| r.output_delay()).unwrap_or(0);

        Ok(Self {
            inner,
            from_rate,
            to_rate,
            pending: Vec::new(),
            delay_left,
            consumed: 0,
            produced: 0,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feed device-rate samples; returns whatever output is ready.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            self.consumed += samples.len() as u64;
            self.produced += samples.len() as u64;
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            self.consumed += needed as u64;
            match resampler.process(&[chunk], None) {
                Ok(mut waves) => {
                    let wave = waves.swap_remove(0);
                    Self::emit(&mut self.delay_left, &mut self.produced, &wave, &mut out);
                }
                Err(e) => warn!("resampling chunk dropped: {}", e),
            }
        }
        out
    }

    /// Drain queued input and the filter tail. Output totals exactly
    /// `consumed * to_rate / from_rate`, rounded.
    pub fn flush(&mut self) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let pending = std::mem::take(&mut self.pending);
        self.consumed += pending.len() as u64;
        let expected = (self.consumed * self.to_rate as u64 + self.from_rate as u64 / 2)
            / self.from_rate as u64;

        if !pending.is_empty() {
            let wave = [pending];
            match resampler.process_partial(Some(&wave[..]), None) {
                Ok(mut waves) => {
                    let wave = waves.swap_remove(0);
                    Self::emit(&mut self.delay_left, &mut self.produced, &wave, &mut out);
                }
                Err(e) => warn!("resampling tail dropped: {}", e),
            }
        }

        // zero input pushes the delayed samples out of the filter
        let mut rounds = 0;
        while self.produced < expected && rounds < 4 {
            rounds += 1;
            match resampler.process_partial(None::<&[Vec<f32>]>, None) {
                Ok(mut waves) => {
                    let wave = waves.swap_remove(0);
                    Self::emit(&mut self.delay_left, &mut self.produced, &wave, &mut out);
                }
                Err(e) => {
                    warn!("resampling flush stopped: {}", e);
                    break;
                }
            }
        }

        let excess = self.produced.saturating_sub(expected) as usize;
        out.truncate(out.len().saturating_sub(excess));
        self.produced -= excess as u64;
        out
    }

    fn emit(delay_left: &mut usize, produced: &mut u64, wave: &[f32], out: &mut Vec<f32>) {
        let skip = (*delay_left).min(wave.len());
        *delay_left -= skip;
        out.extend_from_slice(&wave[skip..]);
        *produced += (wave.len() - skip) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(rate: u32, secs: f32) -> Vec<f32> {
        let len = (rate as f32 * secs) as usize;
        (0..len)
            .map(|i| 0.5 * (2.0 * PI * 220.0 * i as f32 / rate as f32).sin())
            .collect()
    }

    /// Feeds `input` in `buffer`-sized pieces, the way a capture callback would.
    fn convert(from: u32, to: u32, input: &[f32], buffer: usize) -> (usize, Vec<f32>) {
        let mut resampler = MonoResampler::new(from, to).unwrap();
        let mut out = Vec::new();
        for piece in input.chunks(buffer) {
            out.extend(resampler.process(piece));
        }
        let streamed = out.len();
        out.extend(resampler.flush());
        (streamed, out)
    }

    #[test]
    fn one_second_at_48k_is_one_second_at_16k() {
        let (streamed, out) = convert(48_000, 16_000, &sine(48_000, 1.0), 441);
        assert_eq!(out.len(), 16_000);
        assert!(streamed > 15_000, "streamed {streamed}");
    }

    #[test]
    fn one_second_at_44_1k_is_one_second_at_16k() {
        let (streamed, out) = convert(44_100, 16_000, &sine(44_100, 1.0), 512);
        assert_eq!(out.len(), 16_000);
        assert!(streamed > 15_000, "streamed {streamed}");
    }

    #[test]
    fn short_capture_still_yields_its_duration() {
        // less than one resampler chunk
        let (streamed, out) = convert(48_000, 16_000, &sine(48_000, 0.01), 100);
        assert_eq!(streamed, 0);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn resampled_signal_keeps_its_level() {
        let (_, out) = convert(48_000, 16_000, &sine(48_000, 1.0), 480);
        let peak = out[4_000..12_000].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.05, "peak {peak}");
    }

    #[test]
    fn matching_rates_pass_through() {
        let mut resampler = MonoResampler::new(16_000, 16_000).unwrap();
        assert!(resampler.is_passthrough());
        assert_eq!(resampler.process(&[0.1, 0.2, 0.3]), vec![0.1, 0.2, 0.3]);
        assert!(resampler.flush().is_empty());
    }
}

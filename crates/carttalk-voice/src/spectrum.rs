//! Frequency-analysis amplitude: the mean byte-scaled magnitude over one FFT window.
//!
//! Mirrors what a browser `AnalyserNode` reports through `getByteFrequencyData`:
//! Blackman window, per-bin temporal smoothing, dB conversion, and a linear map of
//! `[min_db, max_db]` onto `[0, 255]`. The detector threshold is calibrated against
//! the mean of those bytes.
//!
//! The capture thread only ever touches a [`SampleWindow`]; the transform runs on
//! the reader's side over a copy of that window.

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use tracing::warn;

/// Configuration for the analyser
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyserConfig {
    /// Analysis window in samples (power of two, default: 512)
    pub fft_size: usize,
    /// Weight of the previous frame in per-bin smoothing (default: 0.8)
    pub smoothing: f32,
    /// Magnitude mapped to 0 (default: -100 dB)
    pub min_db: f32,
    /// Magnitude mapped to 255 (default: -30 dB)
    pub max_db: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: 512,
            smoothing: 0.8,
            min_db: -100.0,
            max_db: -30.0,
        }
    }
}

/// The most recent `size` mono samples, zero-filled at start.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<f32>,
    size: usize,
}

impl SampleWindow {
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        let mut samples = VecDeque::with_capacity(size);
        samples.resize(size, 0.0);
        Self { samples, size }
    }

    /// Append mono samples (-1.0..1.0); only the latest `size` are kept.
    pub fn push(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(self.size);
        for &s in &samples[skip..] {
            if self.samples.len() == self.size {
                self.samples.pop_front();
            }
            self.samples.push_back(s);
        }
    }

    /// Replace `out` with the window contents, oldest first.
    pub fn copy_to(&self, out: &mut Vec<f32>) {
        out.clear();
        out.extend(self.samples.iter().copied());
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

pub struct SpectrumAnalyser {
    config: AnalyserConfig,
    fft: Arc<dyn RealToComplex<f32>>,
    blackman: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyser {
    pub fn new(config: AnalyserConfig) -> Self {
        let n = config.fft_size.max(2);
        let blackman = (0..n)
            .map(|i| {
                let x = i as f32 / n as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(n);
        let input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();

        Self {
            smoothed: vec![0.0; n / 2],
            config: AnalyserConfig { fft_size: n, ..config },
            fft,
            blackman,
            input,
            spectrum,
        }
    }

    /// Per-bin byte magnitudes of `window` (length `fft_size / 2`). A shorter
    /// window is treated as zero-padded at the front.
    pub fn byte_frequency_data(&mut self, window: &[f32]) -> Vec<u8> {
        let n = self.config.fft_size;
        let take = window.len().min(n);
        let offset = n - take;
        self.input.iter_mut().for_each(|x| *x = 0.0);
        for (i, &s) in window[window.len() - take..].iter().enumerate() {
            self.input[offset + i] = s * self.blackman[offset + i];
        }

        if let Err(e) = self.fft.process(&mut self.input, &mut self.spectrum) {
            warn!("spectrum transform failed: {}", e);
            return vec![0; n / 2];
        }

        let range = self.config.max_db - self.config.min_db;
        let s = self.config.smoothing;
        let mut bytes = Vec::with_capacity(n / 2);
        for k in 0..n / 2 {
            let magnitude = self.spectrum[k].norm() / n as f32;
            self.smoothed[k] = s * self.smoothed[k] + (1.0 - s) * magnitude;

            let byte = if self.smoothed[k] <= 0.0 {
                0
            } else {
                let db = 20.0 * self.smoothed[k].log10();
                (255.0 / range * (db - self.config.min_db)).clamp(0.0, 255.0) as u8
            };
            bytes.push(byte);
        }
        bytes
    }

    /// Mean of [`Self::byte_frequency_data`], on the 0-255 scale.
    pub fn level(&mut self, window: &[f32]) -> f32 {
        let bins = self.byte_frequency_data(window);
        if bins.is_empty() {
            return 0.0;
        }
        bins.iter().map(|&b| b as f32).sum::<f32>() / bins.len() as f32
    }

    pub fn fft_size(&self) -> usize {
        self.config.fft_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Broadband noise from a fixed LCG; speech energy is spread, unlike a pure tone.
    fn noise(amplitude: f32, len: usize, seed: &mut u32) -> Vec<f32> {
        (0..len)
            .map(|_| {
                *seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345) & 0x7fff_ffff;
                amplitude * (*seed as f32 / (1u32 << 30) as f32 - 1.0)
            })
            .collect()
    }

    fn tone(freq: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / 16000.0).sin())
            .collect()
    }

    fn settle(amplitude: f32) -> f32 {
        let mut window = SampleWindow::new(512);
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig::default());
        let mut scratch = Vec::new();
        let mut seed = 12_345;
        let mut level = 0.0;
        // several frames so smoothing settles
        for _ in 0..10 {
            window.push(&noise(amplitude, 512, &mut seed));
            window.copy_to(&mut scratch);
            level = analyser.level(&scratch);
        }
        level
    }

    #[test]
    fn silence_reads_zero() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig::default());
        assert_eq!(analyser.level(&vec![0.0; 512]), 0.0);
        assert_eq!(analyser.byte_frequency_data(&[]).len(), 256);
    }

    #[test]
    fn loud_broadband_signal_crosses_default_threshold() {
        let level = settle(0.1);
        assert!(level > 15.0, "level {level}");
    }

    #[test]
    fn quiet_signal_stays_below_default_threshold() {
        let level = settle(0.0001);
        assert!(level < 15.0, "level {level}");
    }

    #[test]
    fn tone_lands_in_its_bin() {
        let mut analyser = SpectrumAnalyser::new(AnalyserConfig {
            smoothing: 0.0,
            ..Default::default()
        });
        // 500 Hz at 16 kHz with 512 points sits exactly on bin 16
        let bins = analyser.byte_frequency_data(&tone(500.0, 0.5, 512));
        let peak = bins
            .iter()
            .enumerate()
            .max_by_key(|(_, &b)| b)
            .map(|(k, _)| k);
        assert_eq!(peak, Some(16));
    }

    #[test]
    fn window_keeps_only_latest_samples() {
        let mut window = SampleWindow::new(64);
        window.push(&tone(440.0, 0.8, 1000));
        window.push(&vec![0.0; 64]);

        let mut scratch = Vec::new();
        window.copy_to(&mut scratch);
        assert_eq!(scratch.len(), 64);
        assert_eq!(window.size(), 64);

        let mut analyser = SpectrumAnalyser::new(AnalyserConfig {
            fft_size: 64,
            smoothing: 0.0,
            ..Default::default()
        });
        assert_eq!(analyser.level(&scratch), 0.0);
        assert_eq!(analyser.fft_size(), 64);
    }
}

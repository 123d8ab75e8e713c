//! Comfort noise matching the near-end background noise.
//!
//! The background noise spectrum is tracked from the smoothed capture power
//! with a slowly rising minimum statistic. During the first blocks a more
//! cautious initial estimate is used instead. The noise itself is the square
//! root of that spectrum with a random phase per bin.

use std::f32::consts::{PI, SQRT_2};

use crate::collaborators::EchoState;
use crate::common::{FFT_LENGTH_BY_2, FFT_LENGTH_BY_2_PLUS_1};
use crate::config::EchoRemoverConfig;
use crate::fft_data::FftData;

const SEED: u32 = 42;
const PHASES: usize = 32;
/// Blocks before the noise estimate starts following the capture power.
const NOISE_ESTIMATE_DELAY_BLOCKS: i32 = 50;
/// Blocks during which the initial estimate is used.
const INITIAL_ESTIMATE_BLOCKS: i32 = 1000;
const NOISE_INCREASE_FACTOR: f32 = 1.0002;
/// 20·log10(32768).
const DBFS_NORMALIZATION: f32 = 90.308_99;
/// Bins whose mean amplitude sets the upper band noise level.
const HIGH_BAND_START: usize = FFT_LENGTH_BY_2_PLUS_1 / 2;

/// Power per bin of white noise at `noise_floor_dbfs` after the 128-point
/// transform.
fn noise_floor_power(noise_floor_dbfs: f32) -> f32 {
    64.0 * 10.0f32.powf((DBFS_NORMALIZATION + noise_floor_dbfs) * 0.1)
}

/// Linear congruential generator yielding a phase index per bin.
#[derive(Debug)]
struct PhaseGenerator {
    seed: u32,
    /// `sqrt(2)·sin(2πi/32)`. The factor compensates for the power lost when
    /// windowed blocks of uncorrelated noise are overlap-added.
    table: [f32; PHASES],
}

impl PhaseGenerator {
    fn new(seed: u32) -> Self {
        Self {
            seed,
            table: std::array::from_fn(|i| SQRT_2 * (2.0 * PI * i as f32 / PHASES as f32).sin()),
        }
    }

    /// Returns `(cos, sin)` of the next random phase, scaled by sqrt(2).
    fn next(&mut self) -> (f32, f32) {
        self.seed = self.seed.wrapping_mul(69069).wrapping_add(1) & 0x7fff_ffff;
        let i = (self.seed >> 26) as usize;
        (self.table[i], self.table[(i + PHASES / 4) % PHASES])
    }
}

fn generate_comfort_noise(
    n2: &[f32; FFT_LENGTH_BY_2_PLUS_1],
    phases: &mut PhaseGenerator,
    lower_band_noise: &mut FftData,
    upper_band_noise: &mut FftData,
) {
    let n: [f32; FFT_LENGTH_BY_2_PLUS_1] = std::array::from_fn(|k| n2[k].sqrt());
    let high_band_level =
        n[HIGH_BAND_START..].iter().sum::<f32>() / (FFT_LENGTH_BY_2_PLUS_1 - HIGH_BAND_START) as f32;

    for noise in [&mut *lower_band_noise, &mut *upper_band_noise] {
        noise.re[0] = 0.0;
        noise.im[0] = 0.0;
        noise.re[FFT_LENGTH_BY_2] = 0.0;
        noise.im[FFT_LENGTH_BY_2] = 0.0;
    }

    for k in 1..FFT_LENGTH_BY_2 {
        let (re, im) = phases.next();
        lower_band_noise.re[k] = n[k] * re;
        lower_band_noise.im[k] = n[k] * im;
        upper_band_noise.re[k] = high_band_level * re;
        upper_band_noise.im[k] = high_band_level * im;
    }
}

/// Default comfort noise source.
#[derive(Debug)]
pub struct ComfortNoiseGenerator {
    phases: PhaseGenerator,
    noise_floor: f32,
    n2_initial: Option<Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>>,
    y2_smoothed: Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>,
    n2: Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>,
    n2_counter: i32,
}

impl ComfortNoiseGenerator {
    pub fn new(config: &EchoRemoverConfig, num_capture_channels: usize) -> Self {
        Self {
            phases: PhaseGenerator::new(SEED),
            noise_floor: noise_floor_power(config.comfort_noise.noise_floor_dbfs),
            n2_initial: Some(vec![[0.0; FFT_LENGTH_BY_2_PLUS_1]; num_capture_channels]),
            y2_smoothed: vec![[0.0; FFT_LENGTH_BY_2_PLUS_1]; num_capture_channels],
            n2: vec![[1.0e6; FFT_LENGTH_BY_2_PLUS_1]; num_capture_channels],
            n2_counter: 0,
        }
    }

    /// Updates the noise estimate from the capture power (unless the capture
    /// is saturated) and draws one block of noise per channel.
    pub fn compute(
        &mut self,
        aec_state: &dyn EchoState,
        capture_spectrum: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        lower_band_noise: &mut [FftData],
        upper_band_noise: &mut [FftData],
    ) {
        debug_assert_eq!(capture_spectrum.len(), self.n2.len());
        debug_assert_eq!(lower_band_noise.len(), self.n2.len());
        debug_assert_eq!(upper_band_noise.len(), self.n2.len());

        if !aec_state.saturated_capture() {
            self.update_noise_estimate(capture_spectrum);
        }

        let estimate = self.n2_initial.as_ref().unwrap_or(&self.n2);
        for ((n2, lower), upper) in estimate
            .iter()
            .zip(lower_band_noise.iter_mut())
            .zip(upper_band_noise.iter_mut())
        {
            generate_comfort_noise(n2, &mut self.phases, lower, upper);
        }
    }

    fn update_noise_estimate(&mut self, y2: &[[f32; FFT_LENGTH_BY_2_PLUS_1]]) {
        for (smoothed, y2_ch) in self.y2_smoothed.iter_mut().zip(y2) {
            for (s, &y) in smoothed.iter_mut().zip(y2_ch) {
                *s += 0.1 * (y - *s);
            }
        }

        if self.n2_counter > NOISE_ESTIMATE_DELAY_BLOCKS {
            for (n2_ch, smoothed) in self.n2.iter_mut().zip(&self.y2_smoothed) {
                for (n, &s) in n2_ch.iter_mut().zip(smoothed) {
                    let decreased = if s < *n { 0.9 * s + 0.1 * *n } else { *n };
                    *n = decreased * NOISE_INCREASE_FACTOR;
                }
            }
        }

        if self.n2_initial.is_some() {
            self.n2_counter += 1;
            if self.n2_counter == INITIAL_ESTIMATE_BLOCKS {
                self.n2_initial = None;
            }
        }
        if let Some(n2_initial) = self.n2_initial.as_mut() {
            for (initial_ch, n2_ch) in n2_initial.iter_mut().zip(&self.n2) {
                for (b, &a) in initial_ch.iter_mut().zip(n2_ch) {
                    *b = if a > *b { *b + 0.001 * (a - *b) } else { a };
                }
            }
        }

        let floor = self.noise_floor;
        for spectrum in self
            .n2
            .iter_mut()
            .chain(self.n2_initial.iter_mut().flatten())
        {
            for n in spectrum.iter_mut() {
                *n = n.max(floor);
            }
        }
    }

    /// The tracked background noise power per capture channel.
    pub fn noise_spectrum(&self) -> &[[f32; FFT_LENGTH_BY_2_PLUS_1]] {
        &self.n2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::StaticEchoState;

    fn power(n: &FftData) -> f32 {
        let mut n2 = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
        n.spectrum(&mut n2);
        n2.iter().sum::<f32>() / n2.len() as f32
    }

    #[test]
    fn phase_table_matches_sine() {
        let phases = PhaseGenerator::new(SEED);
        assert_eq!(phases.table[0], 0.0);
        assert!((phases.table[8] - SQRT_2).abs() < 1e-6);
        assert!((phases.table[24] + SQRT_2).abs() < 1e-6);
        assert!((phases.table[4] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn correct_level() {
        const NUM_CHANNELS: usize = 5;
        let mut cng = ComfortNoiseGenerator::new(&EchoRemoverConfig::default(), NUM_CHANNELS);
        let state = StaticEchoState::new(NUM_CHANNELS);

        let n2: Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]> = (0..NUM_CHANNELS)
            .map(|ch| [1000.0 * 1000.0 / (ch + 1) as f32; FFT_LENGTH_BY_2_PLUS_1])
            .collect();
        let mut n_lower = vec![FftData::default(); NUM_CHANNELS];
        let mut n_upper = vec![FftData::default(); NUM_CHANNELS];

        cng.compute(&state, &n2, &mut n_lower, &mut n_upper);
        for ch in 0..NUM_CHANNELS {
            assert!(power(&n_lower[ch]) > 0.0);
            assert!(power(&n_upper[ch]) > 0.0);
        }

        for _ in 0..10000 {
            cng.compute(&state, &n2, &mut n_lower, &mut n_upper);
        }

        for ch in 0..NUM_CHANNELS {
            let expected = 2.0 * n2[ch][0];
            let tolerance = n2[ch][0] / 10.0;
            let lower = power(&n_lower[ch]);
            let upper = power(&n_upper[ch]);
            assert!((expected - lower).abs() < tolerance, "ch {ch}: lower {lower} vs {expected}");
            assert!((expected - upper).abs() < tolerance, "ch {ch}: upper {upper} vs {expected}");
            assert!((cng.noise_spectrum()[ch][3] - n2[ch][3]).abs() < n2[ch][3] / 10.0);
        }
    }

    #[test]
    fn silence_is_floored() {
        let config = EchoRemoverConfig::default();
        let mut cng = ComfortNoiseGenerator::new(&config, 1);
        let state = StaticEchoState::new(1);
        let y2 = vec![[0.0f32; FFT_LENGTH_BY_2_PLUS_1]];
        let mut lower = vec![FftData::default()];
        let mut upper = vec![FftData::default()];
        for _ in 0..3000 {
            cng.compute(&state, &y2, &mut lower, &mut upper);
        }
        let floor = noise_floor_power(config.comfort_noise.noise_floor_dbfs);
        for &n in &cng.noise_spectrum()[0] {
            assert!(n >= floor);
            assert!(n < 1.01 * floor * NOISE_INCREASE_FACTOR);
        }
    }

    #[test]
    fn saturated_capture_freezes_the_estimate() {
        let mut cng = ComfortNoiseGenerator::new(&EchoRemoverConfig::default(), 1);
        let mut state = StaticEchoState::new(1);
        state.saturated_capture = true;
        let y2 = vec![[5.0f32; FFT_LENGTH_BY_2_PLUS_1]];
        let mut lower = vec![FftData::default()];
        let mut upper = vec![FftData::default()];
        for _ in 0..200 {
            cng.compute(&state, &y2, &mut lower, &mut upper);
        }
        assert!(cng.noise_spectrum()[0].iter().all(|&n| n == 1.0e6));
    }
}

//! Echo return loss enhancement of the linear filter.
//!
//! Two estimates are kept per capture channel: a per-bin one used to scale
//! the linear echo estimate and a full-band one in log2 units used for
//! reporting. Both only learn from channels whose filters have converged.

use crate::common::{FFT_LENGTH_BY_2, FFT_LENGTH_BY_2_PLUS_1, fast_approx_log2f};
use crate::config::Erle as ErleConfig;

const EPSILON: f32 = 1e-3;
/// Render power of white noise at -46 dBFS, per bin.
const X2_BAND_ENERGY_THRESHOLD: f32 = 44_015_068.0;
const BLOCKS_TO_HOLD_ERLE: i32 = 100;
const POINTS_TO_ACCUMULATE: i32 = 6;

/// Full-band ERLE over blocks of accumulated energies.
#[derive(Debug)]
struct FullBandErleEstimator {
    min_erle_log2: f32,
    hold_counters: Vec<i32>,
    erle_time_domain_log2: Vec<f32>,
    y2_acum: Vec<f32>,
    e2_acum: Vec<f32>,
    num_points: Vec<i32>,
}

impl FullBandErleEstimator {
    fn new(config: &ErleConfig, num_capture_channels: usize) -> Self {
        let min_erle_log2 = fast_approx_log2f(config.min + EPSILON);
        Self {
            min_erle_log2,
            hold_counters: vec![0; num_capture_channels],
            erle_time_domain_log2: vec![min_erle_log2; num_capture_channels],
            y2_acum: vec![0.0; num_capture_channels],
            e2_acum: vec![0.0; num_capture_channels],
            num_points: vec![0; num_capture_channels],
        }
    }

    fn reset(&mut self) {
        self.erle_time_domain_log2.fill(self.min_erle_log2);
        self.hold_counters.fill(0);
        for ch in 0..self.num_points.len() {
            self.reset_accumulators(ch);
        }
    }

    fn reset_accumulators(&mut self, ch: usize) {
        self.y2_acum[ch] = 0.0;
        self.e2_acum[ch] = 0.0;
        self.num_points[ch] = 0;
    }

    /// Accumulates one point and returns the instantaneous ERLE once enough
    /// points have been gathered.
    fn accumulate(&mut self, ch: usize, y2_sum: f32, e2_sum: f32) -> Option<f32> {
        self.y2_acum[ch] += y2_sum;
        self.e2_acum[ch] += e2_sum;
        self.num_points[ch] += 1;
        if self.num_points[ch] < POINTS_TO_ACCUMULATE {
            return None;
        }
        let erle_log2 = (self.e2_acum[ch] > 0.0)
            .then(|| fast_approx_log2f(self.y2_acum[ch] / self.e2_acum[ch] + EPSILON));
        self.reset_accumulators(ch);
        erle_log2
    }

    fn update(
        &mut self,
        x2: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        y2: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        e2: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        converged_filters: &[bool],
    ) {
        let x2_sum: f32 = x2.iter().sum();
        for ch in 0..y2.len() {
            if converged_filters[ch] && x2_sum > X2_BAND_ENERGY_THRESHOLD * x2.len() as f32 {
                let y2_sum: f32 = y2[ch].iter().sum();
                let e2_sum: f32 = e2[ch].iter().sum();
                if let Some(inst_erle) = self.accumulate(ch, y2_sum, e2_sum) {
                    self.hold_counters[ch] = BLOCKS_TO_HOLD_ERLE;
                    let erle = &mut self.erle_time_domain_log2[ch];
                    *erle += 0.05 * (inst_erle - *erle);
                    *erle = erle.max(self.min_erle_log2);
                }
            }
            self.hold_counters[ch] -= 1;
            if self.hold_counters[ch] == 0 {
                self.reset_accumulators(ch);
            }
        }
    }

    /// The most pessimistic channel.
    fn fullband_erle_log2(&self) -> f32 {
        self.erle_time_domain_log2
            .iter()
            .copied()
            .reduce(f32::min)
            .unwrap_or(self.min_erle_log2)
    }
}

fn max_erle_bands(max_erle_l: f32, max_erle_h: f32) -> [f32; FFT_LENGTH_BY_2_PLUS_1] {
    let mut max_erle = [max_erle_h; FFT_LENGTH_BY_2_PLUS_1];
    max_erle[..FFT_LENGTH_BY_2 / 2].fill(max_erle_l);
    max_erle
}

/// Per-bin ERLE, bounded by `[min, max_l]` in the lower half of the band and
/// `[min, max_h]` in the upper half.
#[derive(Debug)]
struct SubbandErleEstimator {
    min_erle: f32,
    max_erle: [f32; FFT_LENGTH_BY_2_PLUS_1],
    erle: Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>,
    y2_acum: Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>,
    e2_acum: Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>,
    low_render_energy: Vec<[bool; FFT_LENGTH_BY_2_PLUS_1]>,
    num_points: Vec<i32>,
}

impl SubbandErleEstimator {
    fn new(config: &ErleConfig, num_capture_channels: usize) -> Self {
        Self {
            min_erle: config.min,
            max_erle: max_erle_bands(config.max_l, config.max_h),
            erle: vec![[config.min; FFT_LENGTH_BY_2_PLUS_1]; num_capture_channels],
            y2_acum: vec![[0.0; FFT_LENGTH_BY_2_PLUS_1]; num_capture_channels],
            e2_acum: vec![[0.0; FFT_LENGTH_BY_2_PLUS_1]; num_capture_channels],
            low_render_energy: vec![[false; FFT_LENGTH_BY_2_PLUS_1]; num_capture_channels],
            num_points: vec![0; num_capture_channels],
        }
    }

    fn reset(&mut self) {
        for ch in 0..self.erle.len() {
            self.erle[ch].fill(self.min_erle);
            self.y2_acum[ch].fill(0.0);
            self.e2_acum[ch].fill(0.0);
            self.low_render_energy[ch].fill(false);
            self.num_points[ch] = 0;
        }
    }

    fn update(
        &mut self,
        x2: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        y2: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        e2: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        converged_filters: &[bool],
    ) {
        for ch in 0..y2.len() {
            if !converged_filters[ch] {
                continue;
            }

            if self.num_points[ch] == POINTS_TO_ACCUMULATE {
                self.num_points[ch] = 0;
                self.y2_acum[ch].fill(0.0);
                self.e2_acum[ch].fill(0.0);
                self.low_render_energy[ch].fill(false);
            }
            for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
                self.y2_acum[ch][k] += y2[ch][k];
                self.e2_acum[ch][k] += e2[ch][k];
                self.low_render_energy[ch][k] |= x2[k] < X2_BAND_ENERGY_THRESHOLD;
            }
            self.num_points[ch] += 1;

            if self.num_points[ch] == POINTS_TO_ACCUMULATE {
                for k in 1..FFT_LENGTH_BY_2 {
                    if self.e2_acum[ch][k] > 0.0 {
                        let new_erle = self.y2_acum[ch][k] / self.e2_acum[ch][k];
                        update_erle_band(
                            &mut self.erle[ch][k],
                            new_erle,
                            self.low_render_energy[ch][k],
                            self.min_erle,
                            self.max_erle[k],
                        );
                    }
                }
            }

            self.erle[ch][0] = self.erle[ch][1];
            self.erle[ch][FFT_LENGTH_BY_2] = self.erle[ch][FFT_LENGTH_BY_2 - 1];
        }
    }
}

/// Rises slowly, falls faster, and never falls on weak render.
fn update_erle_band(erle: &mut f32, new_erle: f32, low_render_energy: bool, min: f32, max: f32) {
    let alpha = if new_erle < *erle {
        if low_render_energy { 0.0 } else { 0.1 }
    } else {
        0.05
    };
    *erle = (*erle + alpha * (new_erle - *erle)).clamp(min, max);
}

#[derive(Debug)]
pub(crate) struct ErleEstimator {
    startup_phase_length_blocks: usize,
    fullband: FullBandErleEstimator,
    subband: SubbandErleEstimator,
    blocks_since_reset: usize,
}

impl ErleEstimator {
    pub(crate) fn new(
        startup_phase_length_blocks: usize,
        config: &ErleConfig,
        num_capture_channels: usize,
    ) -> Self {
        Self {
            startup_phase_length_blocks,
            fullband: FullBandErleEstimator::new(config, num_capture_channels),
            subband: SubbandErleEstimator::new(config, num_capture_channels),
            blocks_since_reset: 0,
        }
    }

    /// Returns both estimates to their minimum. A delay change also restarts
    /// the startup phase.
    pub(crate) fn reset(&mut self, delay_change: bool) {
        self.fullband.reset();
        self.subband.reset();
        if delay_change {
            self.blocks_since_reset = 0;
        }
    }

    pub(crate) fn update(
        &mut self,
        render_spectrum: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        capture_spectra: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        subtractor_spectra: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        converged_filters: &[bool],
    ) {
        debug_assert_eq!(capture_spectra.len(), subtractor_spectra.len());
        debug_assert_eq!(capture_spectra.len(), converged_filters.len());

        self.blocks_since_reset += 1;
        if self.blocks_since_reset < self.startup_phase_length_blocks {
            return;
        }
        self.subband
            .update(render_spectrum, capture_spectra, subtractor_spectra, converged_filters);
        self.fullband
            .update(render_spectrum, capture_spectra, subtractor_spectra, converged_filters);
    }

    /// Per-bin ERLE per capture channel.
    pub(crate) fn erle(&self) -> &[[f32; FFT_LENGTH_BY_2_PLUS_1]] {
        &self.subband.erle
    }

    pub(crate) fn fullband_erle_log2(&self) -> f32 {
        self.fullband.fullband_erle_log2()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ERLE_TARGET: f32 = 10.0;

    fn spectra(num_capture_channels: usize) -> (
        [f32; FFT_LENGTH_BY_2_PLUS_1],
        Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>,
        Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>,
    ) {
        let x2 = [500.0 * 1000.0 * 1000.0; FFT_LENGTH_BY_2_PLUS_1];
        let y2 = vec![[x2[0] * 9.0; FFT_LENGTH_BY_2_PLUS_1]; num_capture_channels];
        let e2 = vec![[x2[0] * 9.0 / ERLE_TARGET; FFT_LENGTH_BY_2_PLUS_1]; num_capture_channels];
        (x2, y2, e2)
    }

    #[test]
    fn starts_at_minimum() {
        let config = ErleConfig::default();
        let estimator = ErleEstimator::new(0, &config, 2);
        for erle in estimator.erle() {
            assert!(erle.iter().all(|&v| v == config.min));
        }
        let min_log2 = fast_approx_log2f(config.min + EPSILON);
        assert_eq!(estimator.fullband_erle_log2(), min_log2);
        assert!(estimator.fullband_erle_log2() > 0.0);
    }

    #[test]
    fn converges_to_bounded_subband_erle() {
        let config = ErleConfig::default();
        let mut estimator = ErleEstimator::new(0, &config, 1);
        let (x2, y2, e2) = spectra(1);
        for _ in 0..1000 {
            estimator.update(&x2, &y2, &e2, &[true]);
        }
        let erle = &estimator.erle()[0];
        for k in 0..FFT_LENGTH_BY_2 / 2 {
            assert!((erle[k] - config.max_l).abs() < 1e-3, "bin {k}: {}", erle[k]);
        }
        for k in FFT_LENGTH_BY_2 / 2..FFT_LENGTH_BY_2_PLUS_1 {
            assert!((erle[k] - config.max_h).abs() < 1e-3, "bin {k}: {}", erle[k]);
        }
    }

    #[test]
    fn fullband_erle_tracks_energy_ratio() {
        let config = ErleConfig::default();
        let mut estimator = ErleEstimator::new(0, &config, 1);
        let (x2, y2, e2) = spectra(1);
        for _ in 0..2000 {
            estimator.update(&x2, &y2, &e2, &[true]);
        }
        let expected = fast_approx_log2f(ERLE_TARGET + EPSILON);
        assert!((estimator.fullband_erle_log2() - expected).abs() < 0.05);
    }

    #[test]
    fn unconverged_channels_do_not_learn() {
        let config = ErleConfig::default();
        let mut estimator = ErleEstimator::new(0, &config, 2);
        let (x2, y2, e2) = spectra(2);
        for _ in 0..1000 {
            estimator.update(&x2, &y2, &e2, &[true, false]);
        }
        assert!(estimator.erle()[0][5] > config.min);
        assert!(estimator.erle()[1].iter().all(|&v| v == config.min));
        // The full-band value reports the weakest channel.
        assert_eq!(
            estimator.fullband_erle_log2(),
            fast_approx_log2f(config.min + EPSILON)
        );
    }

    #[test]
    fn startup_phase_and_reset() {
        let config = ErleConfig::default();
        let mut estimator = ErleEstimator::new(100, &config, 1);
        let (x2, y2, e2) = spectra(1);
        for _ in 0..99 {
            estimator.update(&x2, &y2, &e2, &[true]);
        }
        assert!(estimator.erle()[0].iter().all(|&v| v == config.min));

        for _ in 0..200 {
            estimator.update(&x2, &y2, &e2, &[true]);
        }
        assert!(estimator.erle()[0][5] > config.min);

        estimator.reset(true);
        assert!(estimator.erle()[0].iter().all(|&v| v == config.min));
        estimator.update(&x2, &y2, &e2, &[true]);
        assert!(estimator.erle()[0].iter().all(|&v| v == config.min));
    }
}

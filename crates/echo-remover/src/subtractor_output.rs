//! Per-channel result of the linear echo canceller.

use crate::common::{BLOCK_SIZE, FFT_LENGTH_BY_2_PLUS_1};
use crate::fft_data::FftData;

/// Echo estimates, cancelled signals and their energies for one capture
/// channel and one block.
#[derive(Debug, Clone)]
pub struct SubtractorOutput {
    /// Echo estimate of the main filter.
    pub s_main: [f32; BLOCK_SIZE],
    /// Echo estimate of the shadow filter.
    pub s_shadow: [f32; BLOCK_SIZE],
    /// Capture minus the main echo estimate.
    pub e_main: [f32; BLOCK_SIZE],
    /// Capture minus the shadow echo estimate.
    pub e_shadow: [f32; BLOCK_SIZE],
    pub e_main_fft: FftData,
    pub e2_main: [f32; FFT_LENGTH_BY_2_PLUS_1],
    pub e2_shadow: [f32; FFT_LENGTH_BY_2_PLUS_1],
    pub s2_main: f32,
    pub s2_shadow: f32,
    pub e2_main_sum: f32,
    pub e2_shadow_sum: f32,
    /// Capture energy.
    pub y2: f32,
    pub s_main_max_abs: f32,
    pub s_shadow_max_abs: f32,
}

impl Default for SubtractorOutput {
    fn default() -> Self {
        Self {
            s_main: [0.0; BLOCK_SIZE],
            s_shadow: [0.0; BLOCK_SIZE],
            e_main: [0.0; BLOCK_SIZE],
            e_shadow: [0.0; BLOCK_SIZE],
            e_main_fft: FftData::default(),
            e2_main: [0.0; FFT_LENGTH_BY_2_PLUS_1],
            e2_shadow: [0.0; FFT_LENGTH_BY_2_PLUS_1],
            s2_main: 0.0,
            s2_shadow: 0.0,
            e2_main_sum: 0.0,
            e2_shadow_sum: 0.0,
            y2: 0.0,
            s_main_max_abs: 0.0,
            s_shadow_max_abs: 0.0,
        }
    }
}

fn energy(x: &[f32]) -> f32 {
    x.iter().map(|&v| v * v).sum()
}

fn max_abs(x: &[f32]) -> f32 {
    x.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()))
}

impl SubtractorOutput {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Recomputes the scalar energies from the time-domain signals and the
    /// capture block `y`.
    pub fn compute_metrics(&mut self, y: &[f32]) {
        self.y2 = energy(y);
        self.e2_main_sum = energy(&self.e_main);
        self.e2_shadow_sum = energy(&self.e_shadow);
        self.s2_main = energy(&self.s_main);
        self.s2_shadow = energy(&self.s_shadow);
        self.s_main_max_abs = max_abs(&self.s_main);
        self.s_shadow_max_abs = max_abs(&self.s_shadow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_everything() {
        let mut out = SubtractorOutput::default();
        out.s_main.fill(1.0);
        out.e_main.fill(2.0);
        out.e_main_fft.re[3] = 4.0;
        out.y2 = 42.0;
        out.s_shadow_max_abs = 7.0;
        out.reset();
        assert_eq!(out.y2, 0.0);
        assert_eq!(out.s_shadow_max_abs, 0.0);
        assert!(out.s_main.iter().all(|&v| v == 0.0));
        assert!(out.e_main.iter().all(|&v| v == 0.0));
        assert_eq!(out.e_main_fft, FftData::default());
    }

    #[test]
    fn compute_metrics_sums_energies() {
        let mut out = SubtractorOutput::default();
        out.e_main.fill(1.0);
        out.e_shadow.fill(2.0);
        out.s_main.fill(-3.0);
        out.s_shadow[5] = 4.0;
        let y = [0.5f32; BLOCK_SIZE];
        out.compute_metrics(&y);

        assert_eq!(out.y2, 0.25 * BLOCK_SIZE as f32);
        assert_eq!(out.e2_main_sum, BLOCK_SIZE as f32);
        assert_eq!(out.e2_shadow_sum, 4.0 * BLOCK_SIZE as f32);
        assert_eq!(out.s2_main, 9.0 * BLOCK_SIZE as f32);
        assert_eq!(out.s2_shadow, 16.0);
        assert_eq!(out.s_main_max_abs, 3.0);
        assert_eq!(out.s_shadow_max_abs, 4.0);
    }
}

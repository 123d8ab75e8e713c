//! Complex half-spectrum of one 128-point real transform.

use crate::common::{FFT_LENGTH_BY_2, FFT_LENGTH_BY_2_PLUS_1};

/// Real and imaginary parts of the 65 non-redundant bins (DC through
/// Nyquist) of a 128-sample real signal. `im[0]` and `im[64]` are zero for
/// any spectrum produced by the transform.
#[derive(Debug, Clone, PartialEq)]
pub struct FftData {
    pub re: [f32; FFT_LENGTH_BY_2_PLUS_1],
    pub im: [f32; FFT_LENGTH_BY_2_PLUS_1],
}

impl Default for FftData {
    fn default() -> Self {
        Self {
            re: [0.0; FFT_LENGTH_BY_2_PLUS_1],
            im: [0.0; FFT_LENGTH_BY_2_PLUS_1],
        }
    }
}

impl FftData {
    /// Copies data from `src`, forcing `im[0]` and `im[N/2]` to zero.
    pub fn assign(&mut self, src: &FftData) {
        self.re = src.re;
        self.im = src.im;
        self.im[0] = 0.0;
        self.im[FFT_LENGTH_BY_2] = 0.0;
    }

    pub fn clear(&mut self) {
        self.re.fill(0.0);
        self.im.fill(0.0);
    }

    /// Computes the power spectrum: `out[k] = re[k]^2 + im[k]^2`.
    pub fn spectrum(&self, power_spectrum: &mut [f32; FFT_LENGTH_BY_2_PLUS_1]) {
        for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
            power_spectrum[k] = self.re[k] * self.re[k] + self.im[k] * self.im[k];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_fft_data() -> FftData {
        let mut x = FftData::default();
        for k in 0..x.re.len() {
            x.re[k] = (k + 1) as f32;
        }
        for k in 1..x.im.len() - 1 {
            x.im[k] = 2.0 * (k + 1) as f32;
        }
        x
    }

    #[test]
    fn assign_zeros_dc_and_nyquist_imaginary_parts() {
        let mut src = make_test_fft_data();
        src.im[0] = 999.0;
        src.im[FFT_LENGTH_BY_2] = 888.0;

        let mut y = FftData::default();
        y.assign(&src);
        assert_eq!(y.re, src.re);
        assert_eq!(y.im[0], 0.0);
        assert_eq!(y.im[FFT_LENGTH_BY_2], 0.0);
        for k in 1..FFT_LENGTH_BY_2 {
            assert_eq!(y.im[k], src.im[k]);
        }
    }

    #[test]
    fn clear_zeros_everything() {
        let mut x = make_test_fft_data();
        x.clear();
        assert_eq!(x, FftData::default());
    }

    #[test]
    fn spectrum_is_squared_magnitude() {
        let x = make_test_fft_data();
        let mut spectrum = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
        x.spectrum(&mut spectrum);

        assert_eq!(spectrum[0], x.re[0] * x.re[0]);
        assert_eq!(spectrum[FFT_LENGTH_BY_2], x.re[FFT_LENGTH_BY_2] * x.re[FFT_LENGTH_BY_2]);
        for k in 1..FFT_LENGTH_BY_2 {
            assert_eq!(spectrum[k], x.re[k] * x.re[k] + x.im[k] * x.im[k]);
        }
    }
}

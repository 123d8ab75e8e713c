//! Block-level spectral transform.
//!
//! Every spectrum in the echo remover comes from a 128-point transform of two
//! consecutive 64-sample blocks, or of one block preceded by zeros. The
//! scaling follows [`echo_fft::Fft128`]: `ifft(fft(x)) == 64 * x`.

use echo_fft::Fft128;

use crate::common::{FFT_LENGTH, FFT_LENGTH_BY_2};
use crate::fft_data::FftData;

/// Analysis window applied before the forward transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Window {
    Rectangular,
    SqrtHanning,
}

/// Square root of the periodic 128-point Hanning window, `w[i] = sin(πi/128)`.
///
/// Squared halves overlap-add to exactly one.
pub(crate) fn sqrt_hanning_window() -> [f32; FFT_LENGTH] {
    std::array::from_fn(|i| (std::f64::consts::PI * i as f64 / FFT_LENGTH as f64).sin() as f32)
}

/// 128-point transform between 64-sample blocks and [`FftData`].
#[derive(Debug)]
pub(crate) struct BlockFft {
    fft: Fft128,
    sqrt_hanning: [f32; FFT_LENGTH],
}

impl Default for BlockFft {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockFft {
    pub(crate) fn new() -> Self {
        Self {
            fft: Fft128::new(),
            sqrt_hanning: sqrt_hanning_window(),
        }
    }

    pub(crate) fn fft(&mut self, x: &[f32; FFT_LENGTH], x_out: &mut FftData) {
        self.fft.forward(x, &mut x_out.re, &mut x_out.im);
    }

    /// Inverse transform, returning `64 * x`.
    pub(crate) fn ifft(&mut self, x_in: &FftData, x: &mut [f32; FFT_LENGTH]) {
        self.fft.inverse(&x_in.re, &x_in.im, x);
    }

    /// Transforms `[0; 64] ++ x` without windowing.
    pub(crate) fn zero_padded_fft(&mut self, x: &[f32], x_out: &mut FftData) {
        debug_assert_eq!(FFT_LENGTH_BY_2, x.len());
        let mut buf = [0.0f32; FFT_LENGTH];
        buf[FFT_LENGTH_BY_2..].copy_from_slice(x);
        self.fft(&buf, x_out);
    }

    /// Transforms `x_old ++ x` after applying `window`.
    pub(crate) fn padded_fft(&mut self, x: &[f32], x_old: &[f32], window: Window, x_out: &mut FftData) {
        debug_assert_eq!(FFT_LENGTH_BY_2, x.len());
        debug_assert_eq!(FFT_LENGTH_BY_2, x_old.len());
        let mut buf = [0.0f32; FFT_LENGTH];
        buf[..FFT_LENGTH_BY_2].copy_from_slice(x_old);
        buf[FFT_LENGTH_BY_2..].copy_from_slice(x);
        if window == Window::SqrtHanning {
            for (v, w) in buf.iter_mut().zip(self.sqrt_hanning.iter()) {
                *v *= w;
            }
        }
        self.fft(&buf, x_out);
    }

    /// Windowed transform of `x_old ++ x` that also rolls `x` into `x_old`,
    /// leaving the overlap tail ready for the next block.
    pub(crate) fn padded_fft_with_tail(
        &mut self,
        x: &[f32],
        x_old: &mut [f32; FFT_LENGTH_BY_2],
        window: Window,
        x_out: &mut FftData,
    ) {
        self.padded_fft(x, &x_old[..], window, x_out);
        x_old.copy_from_slice(x);
    }
}

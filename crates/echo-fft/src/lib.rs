//! Fixed 128-point real FFT for the echo remover.
//!
//! The transform is planned once with [`realfft`] and owns all of its scratch
//! memory, so calling it per block never allocates.
//!
//! # Scaling
//!
//! - [`Fft128::forward`] is unnormalized: `X[k] = Σ x[n]·e^{-2πikn/N}`.
//! - [`Fft128::inverse`] returns `N/2 · x`, i.e. `forward` followed by
//!   `inverse` yields the input scaled by 64. Callers fold the `2/N`
//!   normalization into their own constants.
//!
//! The imaginary parts of the DC and Nyquist bins are ignored by the inverse.

#![deny(unsafe_code)]

use std::sync::Arc;

use realfft::num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

/// Transform length in samples.
pub const FFT_SIZE: usize = 128;

/// Number of non-redundant frequency bins, `FFT_SIZE / 2 + 1`.
pub const NUM_BINS: usize = FFT_SIZE / 2 + 1;

/// Planned forward/inverse real FFT of fixed length [`FFT_SIZE`].
#[derive(derive_more::Debug)]
pub struct Fft128 {
    #[debug(skip)]
    forward: Arc<dyn RealToComplex<f32>>,
    #[debug(skip)]
    inverse: Arc<dyn ComplexToReal<f32>>,
    time: [f32; FFT_SIZE],
    bins: [Complex32; NUM_BINS],
    #[debug(skip)]
    forward_scratch: Vec<Complex32>,
    #[debug(skip)]
    inverse_scratch: Vec<Complex32>,
}

impl Default for Fft128 {
    fn default() -> Self {
        Self::new()
    }
}

impl Fft128 {
    pub fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(FFT_SIZE);
        let inverse = planner.plan_fft_inverse(FFT_SIZE);
        let forward_scratch = forward.make_scratch_vec();
        let inverse_scratch = inverse.make_scratch_vec();
        Self {
            forward,
            inverse,
            time: [0.0; FFT_SIZE],
            bins: [Complex32::new(0.0, 0.0); NUM_BINS],
            forward_scratch,
            inverse_scratch,
        }
    }

    /// Computes the spectrum of `x`, written as separate real and imaginary
    /// parts.
    pub fn forward(
        &mut self,
        x: &[f32; FFT_SIZE],
        re: &mut [f32; NUM_BINS],
        im: &mut [f32; NUM_BINS],
    ) {
        self.time.copy_from_slice(x);
        let result = self.forward.process_with_scratch(
            &mut self.time,
            &mut self.bins,
            &mut self.forward_scratch,
        );
        // Buffer lengths are fixed by the array types, so an error here means
        // the planned lengths are wrong. The output is silenced instead.
        if let Err(err) = result {
            debug_assert!(false, "forward transform failed: {err}");
            re.fill(0.0);
            im.fill(0.0);
            return;
        }

        for (k, bin) in self.bins.iter().enumerate() {
            re[k] = bin.re;
            im[k] = bin.im;
        }
    }

    /// Computes `N/2 · x` from the spectrum given as real and imaginary
    /// parts.
    pub fn inverse(
        &mut self,
        re: &[f32; NUM_BINS],
        im: &[f32; NUM_BINS],
        x: &mut [f32; FFT_SIZE],
    ) {
        for (k, bin) in self.bins.iter_mut().enumerate() {
            *bin = Complex32::new(re[k], im[k]);
        }
        self.bins[0].im = 0.0;
        self.bins[NUM_BINS - 1].im = 0.0;

        let result = self.inverse.process_with_scratch(
            &mut self.bins,
            &mut self.time,
            &mut self.inverse_scratch,
        );
        // The DC and Nyquist imaginary parts were cleared above, which leaves
        // only a length mismatch as a possible error.
        if let Err(err) = result {
            debug_assert!(false, "inverse transform failed: {err}");
            x.fill(0.0);
            return;
        }

        for (out, &v) in x.iter_mut().zip(self.time.iter()) {
            *out = 0.5 * v;
        }
    }
}

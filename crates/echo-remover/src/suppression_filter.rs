//! Gain application and overlap-add synthesis of the output block.

use crate::block::Block;
use crate::block_fft::{BlockFft, sqrt_hanning_window};
use crate::common::{FFT_LENGTH, FFT_LENGTH_BY_2, FFT_LENGTH_BY_2_PLUS_1, num_bands_for_rate};
use crate::fft_data::FftData;

/// Undoes the `64 · x` scaling of the inverse transform.
const IFFT_NORMALIZATION: f32 = 2.0 / FFT_LENGTH as f32;
const HIGH_BAND_NOISE_SCALE: f32 = 0.4;

/// Default output synthesis.
///
/// The lower band is resynthesized from the suppressed spectrum plus comfort
/// noise filling whatever power the gain removed. The upper bands are scaled
/// in the time domain and delayed by one block so that they stay aligned with
/// the lower band.
#[derive(Debug)]
pub struct SuppressionFilter {
    num_bands: usize,
    num_capture_channels: usize,
    fft: BlockFft,
    window: [f32; FFT_LENGTH],
    /// Per band and channel: synthesis overlap for band 0, the delayed block
    /// for the upper bands.
    e_output_old: Vec<Vec<[f32; FFT_LENGTH_BY_2]>>,
}

impl SuppressionFilter {
    pub fn new(sample_rate_hz: usize, num_capture_channels: usize) -> Self {
        let num_bands = num_bands_for_rate(sample_rate_hz);
        debug_assert!(num_bands > 0);
        Self {
            num_bands,
            num_capture_channels,
            fft: BlockFft::new(),
            window: sqrt_hanning_window(),
            e_output_old: vec![vec![[0.0; FFT_LENGTH_BY_2]; num_capture_channels]; num_bands],
        }
    }

    pub fn apply_gain(
        &mut self,
        comfort_noise: &[FftData],
        comfort_noise_high_band: &[FftData],
        suppression_gain: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        high_bands_gain: f32,
        e_lowest_band: &[FftData],
        e: &mut Block,
    ) {
        assert_eq!(self.num_bands, e.num_bands(), "synthesis band count mismatch");
        assert_eq!(
            self.num_capture_channels,
            e.num_channels(),
            "synthesis channel count mismatch"
        );

        let noise_gain: [f32; FFT_LENGTH_BY_2_PLUS_1] =
            std::array::from_fn(|k| (1.0 - suppression_gain[k] * suppression_gain[k]).sqrt());
        let high_bands_noise_scaling =
            HIGH_BAND_NOISE_SCALE * (1.0 - high_bands_gain * high_bands_gain).sqrt();

        for ch in 0..self.num_capture_channels {
            let mut e_freq = FftData::default();
            e_freq.assign(&e_lowest_band[ch]);
            let noise = &comfort_noise[ch];
            for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
                e_freq.re[k] = e_freq.re[k] * suppression_gain[k] + noise_gain[k] * noise.re[k];
                e_freq.im[k] = e_freq.im[k] * suppression_gain[k] + noise_gain[k] * noise.im[k];
            }

            let mut e_extended = [0.0f32; FFT_LENGTH];
            self.fft.ifft(&e_freq, &mut e_extended);

            let overlap = &mut self.e_output_old[0][ch];
            for (i, out) in e.view_mut(0, ch).iter_mut().enumerate() {
                let sum = overlap[i] * self.window[FFT_LENGTH_BY_2 + i]
                    + e_extended[i] * self.window[i];
                *out = sum * IFFT_NORMALIZATION;
            }
            overlap.copy_from_slice(&e_extended[FFT_LENGTH_BY_2..]);

            for band in 1..self.num_bands {
                for x in e.view_mut(band, ch) {
                    *x *= high_bands_gain;
                }
            }

            if self.num_bands > 1 {
                let mut noise_high = FftData::default();
                noise_high.assign(&comfort_noise_high_band[ch]);
                let mut time_domain_noise = [0.0f32; FFT_LENGTH];
                self.fft.ifft(&noise_high, &mut time_domain_noise);
                let scale = high_bands_noise_scaling * IFFT_NORMALIZATION;
                for (x, &n) in e.view_mut(1, ch).iter_mut().zip(&time_domain_noise) {
                    *x += n * scale;
                }
            }

            for band in 1..self.num_bands {
                e.view_mut(band, ch)
                    .swap_with_slice(&mut self.e_output_old[band][ch]);
            }

            for band in 0..self.num_bands {
                for x in e.view_mut(band, ch) {
                    *x = x.clamp(-32768.0, 32767.0);
                }
            }
        }
    }
}

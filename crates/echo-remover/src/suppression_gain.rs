//! Frequency-domain suppression gain.
//!
//! The lower band gets one gain per bin, chosen to push the echo below the
//! near-end signal and the background noise. All capture channels share the
//! most suppressive gain. The upper bands get a single scalar gain.

use crate::block::Block;
use crate::collaborators::{EchoState, RenderAnalyzer};
use crate::common::{BLOCK_SIZE, FFT_LENGTH_BY_2, FFT_LENGTH_BY_2_PLUS_1};
use crate::config::{EchoRemoverConfig, Suppressor, Tuning};

/// Narrow render peaks above this bin leak into the upper bands.
const NARROW_PEAK_UPPER_BAND_LIMIT: usize = FFT_LENGTH_BY_2_PLUS_1 - 10;
const UPPER_BANDS_SUPPRESSION_GAIN: f32 = 0.001;

/// Keeps the lowest bins from suppressing less than their neighbours, so the
/// high-pass filter in front of the echo remover does not inflate the gain.
fn limit_low_frequency_gains(gain: &mut [f32; FFT_LENGTH_BY_2_PLUS_1]) {
    gain[0] = gain[1].min(gain[2]);
    gain[1] = gain[0];
}

/// Caps every bin above the limiting band at the gain of that band.
fn limit_high_frequency_gains(config: &Suppressor, gain: &mut [f32; FFT_LENGTH_BY_2_PLUS_1]) {
    let first = config.high_frequency_suppression.limiting_gain_band;
    let count = config.high_frequency_suppression.bands_in_limiting_gain;
    if count > 0 {
        debug_assert!(first + count <= gain.len());
        let min_upper_gain = gain[first..first + count]
            .iter()
            .copied()
            .fold(1.0f32, f32::min);
        for g in &mut gain[first + 1..] {
            *g = g.min(min_upper_gain);
        }
    }
    gain[FFT_LENGTH_BY_2] = gain[FFT_LENGTH_BY_2 - 1];
}

/// Masking thresholds interpolated per bin between the low and high
/// frequency tuning.
#[derive(Debug)]
struct GainParameters {
    max_inc_factor: f32,
    max_dec_factor_lf: f32,
    enr_transparent: [f32; FFT_LENGTH_BY_2_PLUS_1],
    enr_suppress: [f32; FFT_LENGTH_BY_2_PLUS_1],
    emr_transparent: [f32; FFT_LENGTH_BY_2_PLUS_1],
}

impl GainParameters {
    fn new(last_lf_band: usize, first_hf_band: usize, tuning: &Tuning) -> Self {
        debug_assert!(last_lf_band < first_hf_band);
        let weight = |k: usize| {
            if k <= last_lf_band {
                0.0f32
            } else if k < first_hf_band {
                (k - last_lf_band) as f32 / (first_hf_band - last_lf_band) as f32
            } else {
                1.0
            }
        };
        let lf = &tuning.mask_lf;
        let hf = &tuning.mask_hf;
        let mix = |k: usize, low: f32, high: f32| (1.0 - weight(k)) * low + weight(k) * high;

        Self {
            max_inc_factor: tuning.max_inc_factor,
            max_dec_factor_lf: tuning.max_dec_factor_lf,
            enr_transparent: std::array::from_fn(|k| {
                mix(k, lf.enr_transparent, hf.enr_transparent)
            }),
            enr_suppress: std::array::from_fn(|k| mix(k, lf.enr_suppress, hf.enr_suppress)),
            emr_transparent: std::array::from_fn(|k| {
                mix(k, lf.emr_transparent, hf.emr_transparent)
            }),
        }
    }
}

/// Default gain computer.
#[derive(Debug)]
pub struct SuppressionGain {
    config: Suppressor,
    normal_render_limit: f32,
    num_capture_channels: usize,
    last_gain: [f32; FFT_LENGTH_BY_2_PLUS_1],
    last_nearend: Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>,
    last_echo: Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>,
    initial_state: bool,
    initial_params: GainParameters,
    normal_params: GainParameters,
}

impl SuppressionGain {
    pub fn new(config: &EchoRemoverConfig, num_capture_channels: usize) -> Self {
        let suppressor = &config.suppressor;
        Self {
            config: suppressor.clone(),
            normal_render_limit: config.echo_audibility.normal_render_limit,
            num_capture_channels,
            last_gain: [1.0; FFT_LENGTH_BY_2_PLUS_1],
            last_nearend: vec![[0.0; FFT_LENGTH_BY_2_PLUS_1]; num_capture_channels],
            last_echo: vec![[0.0; FFT_LENGTH_BY_2_PLUS_1]; num_capture_channels],
            initial_state: true,
            initial_params: GainParameters::new(
                suppressor.last_lf_band,
                suppressor.first_hf_band,
                &suppressor.initial_tuning,
            ),
            normal_params: GainParameters::new(
                suppressor.last_lf_band,
                suppressor.first_hf_band,
                &suppressor.normal_tuning,
            ),
        }
    }

    pub fn set_initial_state(&mut self, state: bool) {
        self.initial_state = state;
    }

    /// Computes the amplitude gain of the lower band into `low_band_gain` and
    /// returns the gain for the upper bands.
    pub fn get_gain(
        &mut self,
        nearend_spectrum: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        echo_spectrum: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        residual_echo_spectrum: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        comfort_noise_spectrum: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        render_signal_analyzer: &dyn RenderAnalyzer,
        aec_state: &dyn EchoState,
        render: &Block,
        echo_leakage_detected: bool,
        low_band_gain: &mut [f32; FFT_LENGTH_BY_2_PLUS_1],
    ) -> f32 {
        debug_assert_eq!(nearend_spectrum.len(), self.num_capture_channels);
        debug_assert_eq!(echo_spectrum.len(), self.num_capture_channels);
        debug_assert_eq!(comfort_noise_spectrum.len(), self.num_capture_channels);

        let conservative = self.initial_state || echo_leakage_detected;
        self.lower_band_gain(
            conservative,
            aec_state.saturated_echo(),
            nearend_spectrum,
            echo_spectrum,
            comfort_noise_spectrum,
            low_band_gain,
        );

        self.upper_bands_gain(
            residual_echo_spectrum,
            comfort_noise_spectrum,
            render_signal_analyzer.narrow_peak_band(),
            aec_state.saturated_echo(),
            render,
            low_band_gain,
        )
    }

    fn params(&self, conservative: bool) -> &GainParameters {
        if conservative {
            &self.initial_params
        } else {
            &self.normal_params
        }
    }

    fn upper_bands_gain(
        &self,
        residual_echo_spectrum: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        comfort_noise_spectrum: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        narrow_peak_band: Option<usize>,
        saturated_echo: bool,
        render: &Block,
        low_band_gain: &[f32; FFT_LENGTH_BY_2_PLUS_1],
    ) -> f32 {
        debug_assert!(render.num_bands() > 0);
        if render.num_bands() == 1 {
            return 1.0;
        }

        if narrow_peak_band.is_some_and(|band| band > NARROW_PEAK_UPPER_BAND_LIMIT) {
            return UPPER_BANDS_SUPPRESSION_GAIN;
        }

        let gain_below_8_khz = low_band_gain[FFT_LENGTH_BY_2 / 2..]
            .iter()
            .copied()
            .fold(1.0f32, f32::min);

        if saturated_echo {
            return UPPER_BANDS_SUPPRESSION_GAIN.min(gain_below_8_khz);
        }

        let band_energy = |band: usize| {
            (0..render.num_channels())
                .map(|ch| render.view(band, ch).iter().map(|x| x * x).sum::<f32>())
                .fold(0.0f32, f32::max)
        };
        let low_band_energy = band_energy(0);
        let high_band_energy = (1..render.num_bands())
            .map(band_energy)
            .fold(0.0f32, f32::max);

        let bands = &self.config.high_bands_suppression;
        let activation_threshold = BLOCK_SIZE as f32 * bands.anti_howling_activation_threshold;
        let anti_howling_gain = if high_band_energy < low_band_energy.max(activation_threshold) {
            1.0
        } else {
            debug_assert!(high_band_energy > 0.0);
            bands.anti_howling_gain * (low_band_energy / high_band_energy).sqrt()
        };

        let low_frequency_energy = |spectrum: &[f32; FFT_LENGTH_BY_2_PLUS_1]| -> f32 {
            spectrum[1..16].iter().sum()
        };
        let significant_echo = residual_echo_spectrum
            .iter()
            .zip(comfort_noise_spectrum)
            .any(|(echo, noise)| {
                low_frequency_energy(echo) > bands.enr_threshold * low_frequency_energy(noise)
            });
        let gain_bound = if significant_echo {
            bands.max_gain_during_echo
        } else {
            1.0
        };

        gain_below_8_khz.min(anti_howling_gain).min(gain_bound)
    }

    /// Power gain that makes the echo inaudible given the near-end signal and
    /// the background noise masker.
    fn gain_to_no_audible_echo(
        p: &GainParameters,
        nearend: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        echo: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        masker: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        gain: &mut [f32; FFT_LENGTH_BY_2_PLUS_1],
    ) {
        for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
            let enr = echo[k] / (nearend[k] + 1.0);
            let emr = echo[k] / (masker[k] + 1.0);
            gain[k] = if enr > p.enr_transparent[k] && emr > p.emr_transparent[k] {
                let g = (p.enr_suppress[k] - enr) / (p.enr_suppress[k] - p.enr_transparent[k]);
                g.max(p.emr_transparent[k] / emr)
            } else {
                1.0
            };
        }
    }

    /// Lowest gain allowed: enough to keep the echo just audible, and in the
    /// lowest bins no faster a drop than the decrease factor allows after
    /// near-end activity.
    fn min_gain(
        &self,
        conservative: bool,
        saturated_echo: bool,
        echo: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        last_nearend: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        last_echo: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        min_gain: &mut [f32; FFT_LENGTH_BY_2_PLUS_1],
    ) {
        if saturated_echo {
            min_gain.fill(0.0);
            return;
        }

        for (m, &e) in min_gain.iter_mut().zip(echo) {
            *m = if e > 0.0 {
                (self.normal_render_limit / e).min(1.0)
            } else {
                1.0
            };
        }

        if !self.initial_state {
            let dec = self.params(conservative).max_dec_factor_lf;
            for k in 0..=self.config.last_lf_smoothing_band.min(FFT_LENGTH_BY_2) {
                if last_nearend[k] > last_echo[k] {
                    min_gain[k] = min_gain[k].max(self.last_gain[k] * dec).min(1.0);
                }
            }
        }
    }

    /// Highest gain allowed: a bounded increase over the previous block.
    fn max_gain(&self, conservative: bool, max_gain: &mut [f32; FFT_LENGTH_BY_2_PLUS_1]) {
        let inc = self.params(conservative).max_inc_factor;
        let floor = self.config.floor_first_increase;
        for (m, &last) in max_gain.iter_mut().zip(&self.last_gain) {
            *m = (last * inc).max(floor).min(1.0);
        }
    }

    fn lower_band_gain(
        &mut self,
        conservative: bool,
        saturated_echo: bool,
        nearend_spectrum: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        echo_spectrum: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        comfort_noise_spectrum: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        gain: &mut [f32; FFT_LENGTH_BY_2_PLUS_1],
    ) {
        gain.fill(1.0);
        let mut max_gain = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
        self.max_gain(conservative, &mut max_gain);

        for ch in 0..self.num_capture_channels {
            let nearend = &nearend_spectrum[ch];
            let echo = &echo_spectrum[ch];

            let mut min_gain = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
            self.min_gain(
                conservative,
                saturated_echo,
                echo,
                &self.last_nearend[ch],
                &self.last_echo[ch],
                &mut min_gain,
            );

            let mut g = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
            Self::gain_to_no_audible_echo(
                self.params(conservative),
                nearend,
                echo,
                &comfort_noise_spectrum[ch],
                &mut g,
            );

            for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
                gain[k] = gain[k].min(g[k].min(max_gain[k]).max(min_gain[k]));
            }

            self.last_nearend[ch] = *nearend;
            self.last_echo[ch] = *echo;
        }

        limit_low_frequency_gains(gain);
        limit_high_frequency_gains(&self.config, gain);

        self.last_gain = *gain;

        for g in gain.iter_mut() {
            *g = g.sqrt();
        }
    }
}

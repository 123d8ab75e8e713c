//! Update gain of the main adaptive filter.
//!
//! NLMS step with a per-bin estimate of the filter error power `H_error`.
//! The estimate shrinks as the filter adapts and grows again through leakage
//! proportional to the ERL, faster when the main filter looks diverged.

use crate::common::FFT_LENGTH_BY_2_PLUS_1;
use crate::config::MainConfiguration;
use crate::echo_path_variability::{DelayAdjustment, EchoPathVariability};
use crate::fft_data::FftData;
use crate::subtractor_output::SubtractorOutput;

const H_ERROR_INITIAL: f32 = 10_000.0;

#[derive(Debug)]
pub(crate) struct MainFilterUpdateGain {
    config_change_duration_blocks: i32,
    one_by_config_change_duration_blocks: f32,
    current_config: MainConfiguration,
    target_config: MainConfiguration,
    old_target_config: MainConfiguration,
    h_error: [f32; FFT_LENGTH_BY_2_PLUS_1],
    call_counter: usize,
    config_change_counter: i32,
}

impl MainFilterUpdateGain {
    pub(crate) fn new(config: &MainConfiguration, config_change_duration_blocks: usize) -> Self {
        debug_assert!(config_change_duration_blocks > 0);
        let mut gain = Self {
            config_change_duration_blocks: config_change_duration_blocks as i32,
            one_by_config_change_duration_blocks: 1.0 / config_change_duration_blocks as f32,
            current_config: config.clone(),
            target_config: config.clone(),
            old_target_config: config.clone(),
            h_error: [H_ERROR_INITIAL; FFT_LENGTH_BY_2_PLUS_1],
            call_counter: 0,
            config_change_counter: 0,
        };
        gain.set_config(config, true);
        gain
    }

    /// A delay change invalidates the error estimate. Anything other than a
    /// pure gain change restarts the warm-up.
    pub(crate) fn handle_echo_path_change(&mut self, echo_path_variability: &EchoPathVariability) {
        if echo_path_variability.delay_change != DelayAdjustment::None {
            self.h_error.fill(H_ERROR_INITIAL);
        }
        if !echo_path_variability.gain_change {
            self.call_counter = 0;
        }
    }

    /// Computes the gain `G` for the current block.
    ///
    /// No update happens while the filter is warming up or the capture is
    /// saturated.
    pub(crate) fn compute(
        &mut self,
        render_power: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        subtractor_output: &SubtractorOutput,
        erl: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        size_partitions: usize,
        saturated_capture_signal: bool,
        disallow_leakage_diverged: bool,
        gain_fft: &mut FftData,
    ) {
        let e_main = &subtractor_output.e_main_fft;
        let e2_main = &subtractor_output.e2_main;
        let e2_shadow = &subtractor_output.e2_shadow;

        self.call_counter += 1;
        self.update_current_config();

        if saturated_capture_signal || self.call_counter <= size_partitions {
            gain_fft.clear();
        } else {
            // mu = H_error / (0.5 * H_error * X2 + n * E2).
            let mut mu = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
            for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
                if render_power[k] >= self.current_config.noise_gate {
                    mu[k] = self.h_error[k]
                        / (0.5 * self.h_error[k] * render_power[k]
                            + size_partitions as f32 * e2_main[k]);
                }
            }

            // H_error -= 0.5 * mu * X2 * H_error.
            for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
                self.h_error[k] -= 0.5 * mu[k] * render_power[k] * self.h_error[k];
            }

            // G = mu * E.
            for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
                gain_fft.re[k] = mu[k] * e_main.re[k];
                gain_fft.im[k] = mu[k] * e_main.im[k];
            }
        }

        let config = &self.current_config;
        for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
            let leakage = if e2_main[k] <= e2_shadow[k] || disallow_leakage_diverged {
                config.leakage_converged
            } else {
                config.leakage_diverged
            };
            self.h_error[k] =
                (self.h_error[k] + leakage * erl[k]).clamp(config.error_floor, config.error_ceil);
        }
    }

    /// Switches to `config`, either at once or blended in over the change
    /// duration.
    pub(crate) fn set_config(&mut self, config: &MainConfiguration, immediate_effect: bool) {
        if immediate_effect {
            self.old_target_config = config.clone();
            self.current_config = config.clone();
            self.target_config = config.clone();
            self.config_change_counter = 0;
        } else {
            self.old_target_config = self.current_config.clone();
            self.target_config = config.clone();
            self.config_change_counter = self.config_change_duration_blocks;
        }
    }

    fn update_current_config(&mut self) {
        if self.config_change_counter <= 0 {
            return;
        }
        self.config_change_counter -= 1;
        if self.config_change_counter == 0 {
            self.current_config = self.target_config.clone();
            self.old_target_config = self.target_config.clone();
            return;
        }

        let weight = self.config_change_counter as f32 * self.one_by_config_change_duration_blocks;
        let average = |from: f32, to: f32| from * weight + to * (1.0 - weight);
        let (old, target) = (&self.old_target_config, &self.target_config);
        self.current_config.leakage_converged =
            average(old.leakage_converged, target.leakage_converged);
        self.current_config.leakage_diverged =
            average(old.leakage_diverged, target.leakage_diverged);
        self.current_config.error_floor = average(old.error_floor, target.error_floor);
        self.current_config.error_ceil = average(old.error_ceil, target.error_ceil);
        self.current_config.noise_gate = average(old.noise_gate, target.noise_gate);
    }
}

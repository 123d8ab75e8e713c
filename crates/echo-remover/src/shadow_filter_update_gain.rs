//! Fixed-rate normalized update gain of the shadow filter.

use crate::common::FFT_LENGTH_BY_2_PLUS_1;
use crate::config::ShadowConfiguration;
use crate::fft_data::FftData;

#[derive(Debug)]
pub(crate) struct ShadowFilterUpdateGain {
    current_config: ShadowConfiguration,
    target_config: ShadowConfiguration,
    old_target_config: ShadowConfiguration,
    config_change_duration_blocks: i32,
    one_by_config_change_duration_blocks: f32,
    call_counter: usize,
    config_change_counter: i32,
}

impl ShadowFilterUpdateGain {
    pub(crate) fn new(config: &ShadowConfiguration, config_change_duration_blocks: usize) -> Self {
        debug_assert!(config_change_duration_blocks > 0);
        let mut gain = Self {
            current_config: config.clone(),
            target_config: config.clone(),
            old_target_config: config.clone(),
            config_change_duration_blocks: config_change_duration_blocks as i32,
            one_by_config_change_duration_blocks: 1.0 / config_change_duration_blocks as f32,
            call_counter: 0,
            config_change_counter: 0,
        };
        gain.set_config(config, true);
        gain
    }

    pub(crate) fn handle_echo_path_change(&mut self) {
        self.call_counter = 0;
    }

    /// `G = rate / X2 · E` in every bin where the render power exceeds the
    /// noise gate.
    pub(crate) fn compute(
        &mut self,
        render_power: &[f32; FFT_LENGTH_BY_2_PLUS_1],
        e_shadow: &FftData,
        size_partitions: usize,
        saturated_capture_signal: bool,
        g: &mut FftData,
    ) {
        self.call_counter += 1;
        self.update_current_config();

        if saturated_capture_signal || self.call_counter <= size_partitions {
            g.clear();
            return;
        }

        for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
            let mu = if render_power[k] > self.current_config.noise_gate {
                self.current_config.rate / render_power[k]
            } else {
                0.0
            };
            g.re[k] = mu * e_shadow.re[k];
            g.im[k] = mu * e_shadow.im[k];
        }
    }

    pub(crate) fn set_config(&mut self, config: &ShadowConfiguration, immediate_effect: bool) {
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
        self.current_config.rate = average(self.old_target_config.rate, self.target_config.rate);
        self.current_config.noise_gate =
            average(self.old_target_config.noise_gate, self.target_config.noise_gate);
    }
}

//! Echo remover configuration.
//!
//! A plain struct tree with tuned defaults. [`EchoRemoverConfig::validate`]
//! clamps every value into its legal range and logs each adjustment.

/// Configuration for the echo remover and its default collaborators.
#[derive(Debug, Clone, Default)]
pub struct EchoRemoverConfig {
    pub delay: Delay,
    pub filter: Filter,
    pub erle: Erle,
    pub ep_strength: EpStrength,
    pub echo_audibility: EchoAudibility,
    pub render_levels: RenderLevels,
    pub echo_model: EchoModel,
    pub comfort_noise: ComfortNoise,
    pub suppressor: Suppressor,
}

impl EchoRemoverConfig {
    /// Clamps parameters to reasonable ranges.
    /// Returns `true` if no changes were needed.
    pub fn validate(&mut self) -> bool {
        let mut ok = true;

        ok &= limit_usize(
            &mut self.delay.delay_headroom_samples,
            0,
            5000,
            "delay.delay_headroom_samples",
        );

        ok &= validate_main(&mut self.filter.main, "filter.main");
        ok &= validate_main(&mut self.filter.main_initial, "filter.main_initial");
        if self.filter.main.length_blocks < self.filter.main_initial.length_blocks {
            tracing::warn!(
                main = self.filter.main.length_blocks,
                main_initial = self.filter.main_initial.length_blocks,
                "initial main filter longer than steady-state filter; shortening it"
            );
            self.filter.main_initial.length_blocks = self.filter.main.length_blocks;
            ok = false;
        }

        ok &= validate_shadow(&mut self.filter.shadow, "filter.shadow");
        ok &= validate_shadow(&mut self.filter.shadow_initial, "filter.shadow_initial");
        if self.filter.shadow.length_blocks < self.filter.shadow_initial.length_blocks {
            tracing::warn!(
                shadow = self.filter.shadow.length_blocks,
                shadow_initial = self.filter.shadow_initial.length_blocks,
                "initial shadow filter longer than steady-state filter; shortening it"
            );
            self.filter.shadow_initial.length_blocks = self.filter.shadow.length_blocks;
            ok = false;
        }

        ok &= limit_usize(
            &mut self.filter.config_change_duration_blocks,
            1,
            100_000,
            "filter.config_change_duration_blocks",
        );
        ok &= limit_f32(
            &mut self.filter.initial_state_seconds,
            0.0,
            100.0,
            "filter.initial_state_seconds",
        );
        ok &= limit_i32(
            &mut self.filter.shadow_reset_hangover_blocks,
            0,
            250_000,
            "filter.shadow_reset_hangover_blocks",
        );

        ok &= limit_f32(&mut self.erle.min, 1.0, 100_000.0, "erle.min");
        ok &= limit_f32(&mut self.erle.max_l, 1.0, 100_000.0, "erle.max_l");
        ok &= limit_f32(&mut self.erle.max_h, 1.0, 100_000.0, "erle.max_h");
        if self.erle.min > self.erle.max_l || self.erle.min > self.erle.max_h {
            let min = self.erle.max_l.min(self.erle.max_h);
            tracing::warn!(from = self.erle.min, to = min, "erle.min above erle maximum");
            self.erle.min = min;
            ok = false;
        }

        ok &= limit_f32(
            &mut self.ep_strength.default_gain,
            0.0,
            1_000_000.0,
            "ep_strength.default_gain",
        );

        let max_power = 32768.0f32 * 32768.0;
        ok &= limit_f32(
            &mut self.echo_audibility.normal_render_limit,
            0.0,
            max_power,
            "echo_audibility.normal_render_limit",
        );

        ok &= limit_f32(
            &mut self.render_levels.active_render_limit,
            0.0,
            32768.0,
            "render_levels.active_render_limit",
        );

        ok &= limit_f32(
            &mut self.echo_model.noise_gate_power,
            0.0,
            1_000_000.0,
            "echo_model.noise_gate_power",
        );
        ok &= limit_f32(
            &mut self.echo_model.noise_gate_slope,
            0.0,
            1.0,
            "echo_model.noise_gate_slope",
        );
        ok &= limit_usize(
            &mut self.echo_model.render_pre_window_size,
            0,
            100,
            "echo_model.render_pre_window_size",
        );
        ok &= limit_usize(
            &mut self.echo_model.render_post_window_size,
            0,
            100,
            "echo_model.render_post_window_size",
        );

        ok &= limit_f32(
            &mut self.comfort_noise.noise_floor_dbfs,
            -200.0,
            0.0,
            "comfort_noise.noise_floor_dbfs",
        );

        ok &= validate_tuning(&mut self.suppressor.normal_tuning, "suppressor.normal_tuning");
        ok &= validate_tuning(&mut self.suppressor.initial_tuning, "suppressor.initial_tuning");
        ok &= limit_usize(
            &mut self.suppressor.last_lf_smoothing_band,
            0,
            64,
            "suppressor.last_lf_smoothing_band",
        );
        ok &= limit_usize(&mut self.suppressor.last_lf_band, 0, 63, "suppressor.last_lf_band");
        ok &= limit_usize(
            &mut self.suppressor.first_hf_band,
            self.suppressor.last_lf_band + 1,
            64,
            "suppressor.first_hf_band",
        );
        ok &= limit_f32(
            &mut self.suppressor.high_bands_suppression.enr_threshold,
            0.0,
            100.0,
            "suppressor.high_bands_suppression.enr_threshold",
        );
        ok &= limit_f32(
            &mut self.suppressor.high_bands_suppression.max_gain_during_echo,
            0.0,
            1.0,
            "suppressor.high_bands_suppression.max_gain_during_echo",
        );
        ok &= limit_f32(
            &mut self
                .suppressor
                .high_bands_suppression
                .anti_howling_activation_threshold,
            0.0,
            max_power,
            "suppressor.high_bands_suppression.anti_howling_activation_threshold",
        );
        ok &= limit_f32(
            &mut self.suppressor.high_bands_suppression.anti_howling_gain,
            0.0,
            1.0,
            "suppressor.high_bands_suppression.anti_howling_gain",
        );
        ok &= limit_usize(
            &mut self.suppressor.high_frequency_suppression.limiting_gain_band,
            1,
            64,
            "suppressor.high_frequency_suppression.limiting_gain_band",
        );
        let max_bands_in_limiting_gain =
            64 - self.suppressor.high_frequency_suppression.limiting_gain_band;
        ok &= limit_usize(
            &mut self.suppressor.high_frequency_suppression.bands_in_limiting_gain,
            0,
            max_bands_in_limiting_gain,
            "suppressor.high_frequency_suppression.bands_in_limiting_gain",
        );
        ok &= limit_f32(
            &mut self.suppressor.floor_first_increase,
            0.0,
            1_000_000.0,
            "suppressor.floor_first_increase",
        );

        ok
    }
}

fn validate_main(c: &mut MainConfiguration, section: &'static str) -> bool {
    let mut ok = true;
    ok &= floor_limit_usize(&mut c.length_blocks, 1, section, "length_blocks");
    ok &= limit_f32(&mut c.leakage_converged, 0.0, 1000.0, section);
    ok &= limit_f32(&mut c.leakage_diverged, 0.0, 1000.0, section);
    ok &= limit_f32(&mut c.error_floor, 0.0, 1000.0, section);
    ok &= limit_f32(&mut c.error_ceil, 0.0, 100_000_000.0, section);
    ok &= limit_f32(&mut c.noise_gate, 0.0, 100_000_000.0, section);
    ok
}

fn validate_shadow(c: &mut ShadowConfiguration, section: &'static str) -> bool {
    let mut ok = true;
    ok &= floor_limit_usize(&mut c.length_blocks, 1, section, "length_blocks");
    ok &= limit_f32(&mut c.rate, 0.0, 1.0, section);
    ok &= limit_f32(&mut c.noise_gate, 0.0, 100_000_000.0, section);
    ok
}

fn validate_tuning(t: &mut Tuning, section: &'static str) -> bool {
    let mut ok = true;
    ok &= limit_f32(&mut t.mask_lf.enr_transparent, 0.0, 100.0, section);
    ok &= limit_f32(&mut t.mask_lf.enr_suppress, 0.0, 100.0, section);
    ok &= limit_f32(&mut t.mask_lf.emr_transparent, 0.0, 100.0, section);
    ok &= limit_f32(&mut t.mask_hf.enr_transparent, 0.0, 100.0, section);
    ok &= limit_f32(&mut t.mask_hf.enr_suppress, 0.0, 100.0, section);
    ok &= limit_f32(&mut t.mask_hf.emr_transparent, 0.0, 100.0, section);
    ok &= limit_f32(&mut t.max_inc_factor, 0.0, 100.0, section);
    ok &= limit_f32(&mut t.max_dec_factor_lf, 0.0, 100.0, section);
    ok
}

fn limit_f32(value: &mut f32, min: f32, max: f32, name: &'static str) -> bool {
    let clamped = value.clamp(min, max);
    let clamped = if clamped.is_finite() { clamped } else { min };
    let unchanged = *value == clamped;
    if !unchanged {
        tracing::warn!(field = name, from = *value, to = clamped, "configuration value clamped");
    }
    *value = clamped;
    unchanged
}

fn limit_usize(value: &mut usize, min: usize, max: usize, name: &'static str) -> bool {
    let clamped = (*value).clamp(min, max);
    let unchanged = *value == clamped;
    if !unchanged {
        tracing::warn!(field = name, from = *value, to = clamped, "configuration value clamped");
    }
    *value = clamped;
    unchanged
}

fn limit_i32(value: &mut i32, min: i32, max: i32, name: &'static str) -> bool {
    let clamped = (*value).clamp(min, max);
    let unchanged = *value == clamped;
    if !unchanged {
        tracing::warn!(field = name, from = *value, to = clamped, "configuration value clamped");
    }
    *value = clamped;
    unchanged
}

fn floor_limit_usize(
    value: &mut usize,
    min: usize,
    section: &'static str,
    field: &'static str,
) -> bool {
    if *value < min {
        tracing::warn!(section, field, from = *value, to = min, "configuration value raised");
        *value = min;
        false
    } else {
        true
    }
}

#[derive(Debug, Clone)]
pub struct Delay {
    /// Samples of render history kept ahead of the direct echo path.
    pub delay_headroom_samples: usize,
}

impl Default for Delay {
    fn default() -> Self {
        Self {
            delay_headroom_samples: 32,
        }
    }
}

/// Tuning of the main filter's NLMS update.
#[derive(Debug, Clone)]
pub struct MainConfiguration {
    pub length_blocks: usize,
    pub leakage_converged: f32,
    pub leakage_diverged: f32,
    pub error_floor: f32,
    pub error_ceil: f32,
    pub noise_gate: f32,
}

/// Tuning of the shadow filter's fixed-rate update.
#[derive(Debug, Clone)]
pub struct ShadowConfiguration {
    pub length_blocks: usize,
    pub rate: f32,
    pub noise_gate: f32,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub main: MainConfiguration,
    pub shadow: ShadowConfiguration,
    pub main_initial: MainConfiguration,
    pub shadow_initial: ShadowConfiguration,
    pub config_change_duration_blocks: usize,
    pub initial_state_seconds: f32,
    pub shadow_reset_hangover_blocks: i32,
    pub enable_shadow_filter_output_usage: bool,
    pub use_linear_filter: bool,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            main: MainConfiguration {
                length_blocks: 13,
                leakage_converged: 0.00005,
                leakage_diverged: 0.05,
                error_floor: 0.001,
                error_ceil: 2.0,
                noise_gate: 20_075_344.0,
            },
            shadow: ShadowConfiguration {
                length_blocks: 13,
                rate: 0.7,
                noise_gate: 20_075_344.0,
            },
            main_initial: MainConfiguration {
                length_blocks: 12,
                leakage_converged: 0.005,
                leakage_diverged: 0.5,
                error_floor: 0.001,
                error_ceil: 2.0,
                noise_gate: 20_075_344.0,
            },
            shadow_initial: ShadowConfiguration {
                length_blocks: 12,
                rate: 0.9,
                noise_gate: 20_075_344.0,
            },
            config_change_duration_blocks: 250,
            initial_state_seconds: 2.5,
            shadow_reset_hangover_blocks: 25,
            enable_shadow_filter_output_usage: true,
            use_linear_filter: true,
        }
    }
}

/// Bounds on the echo return loss enhancement.
#[derive(Debug, Clone)]
pub struct Erle {
    pub min: f32,
    /// Upper bound for the lower half of the spectrum.
    pub max_l: f32,
    /// Upper bound for the upper half of the spectrum.
    pub max_h: f32,
}

impl Default for Erle {
    fn default() -> Self {
        Self {
            min: 1.0,
            max_l: 4.0,
            max_h: 1.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpStrength {
    pub default_gain: f32,
    pub echo_can_saturate: bool,
}

impl Default for EpStrength {
    fn default() -> Self {
        Self {
            default_gain: 1.0,
            echo_can_saturate: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EchoAudibility {
    /// Residual echo power below which suppression is not needed.
    pub normal_render_limit: f32,
}

impl Default for EchoAudibility {
    fn default() -> Self {
        Self {
            normal_render_limit: 64.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderLevels {
    pub active_render_limit: f32,
}

impl Default for RenderLevels {
    fn default() -> Self {
        Self {
            active_render_limit: 100.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EchoModel {
    pub noise_gate_power: f32,
    pub noise_gate_slope: f32,
    pub render_pre_window_size: usize,
    pub render_post_window_size: usize,
}

impl Default for EchoModel {
    fn default() -> Self {
        Self {
            noise_gate_power: 27509.42,
            noise_gate_slope: 0.3,
            render_pre_window_size: 1,
            render_post_window_size: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComfortNoise {
    pub noise_floor_dbfs: f32,
}

impl Default for ComfortNoise {
    fn default() -> Self {
        Self {
            noise_floor_dbfs: -96.03406,
        }
    }
}

/// Echo-to-nearend (`enr`) and echo-to-masker (`emr`) ratios that bound the
/// transparent and suppressing regions of the gain curve.
#[derive(Debug, Clone)]
pub struct MaskingThresholds {
    pub enr_transparent: f32,
    pub enr_suppress: f32,
    pub emr_transparent: f32,
}

#[derive(Debug, Clone)]
pub struct Tuning {
    pub mask_lf: MaskingThresholds,
    pub mask_hf: MaskingThresholds,
    pub max_inc_factor: f32,
    pub max_dec_factor_lf: f32,
}

#[derive(Debug, Clone)]
pub struct HighBandsSuppression {
    pub enr_threshold: f32,
    pub max_gain_during_echo: f32,
    pub anti_howling_activation_threshold: f32,
    pub anti_howling_gain: f32,
}

impl Default for HighBandsSuppression {
    fn default() -> Self {
        Self {
            enr_threshold: 1.0,
            max_gain_during_echo: 1.0,
            anti_howling_activation_threshold: 400.0,
            anti_howling_gain: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HighFrequencySuppression {
    pub limiting_gain_band: usize,
    pub bands_in_limiting_gain: usize,
}

impl Default for HighFrequencySuppression {
    fn default() -> Self {
        Self {
            limiting_gain_band: 16,
            bands_in_limiting_gain: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Suppressor {
    pub normal_tuning: Tuning,
    /// Used during the initial state and while echo leakage is reported.
    pub initial_tuning: Tuning,
    pub last_lf_smoothing_band: usize,
    pub last_lf_band: usize,
    pub first_hf_band: usize,
    pub high_bands_suppression: HighBandsSuppression,
    pub high_frequency_suppression: HighFrequencySuppression,
    pub floor_first_increase: f32,
}

impl Default for Suppressor {
    fn default() -> Self {
        Self {
            normal_tuning: Tuning {
                mask_lf: MaskingThresholds {
                    enr_transparent: 0.3,
                    enr_suppress: 0.4,
                    emr_transparent: 0.3,
                },
                mask_hf: MaskingThresholds {
                    enr_transparent: 0.07,
                    enr_suppress: 0.1,
                    emr_transparent: 0.3,
                },
                max_inc_factor: 2.0,
                max_dec_factor_lf: 0.25,
            },
            initial_tuning: Tuning {
                mask_lf: MaskingThresholds {
                    enr_transparent: 0.1,
                    enr_suppress: 0.2,
                    emr_transparent: 0.3,
                },
                mask_hf: MaskingThresholds {
                    enr_transparent: 0.05,
                    enr_suppress: 0.07,
                    emr_transparent: 0.3,
                },
                max_inc_factor: 1.5,
                max_dec_factor_lf: 0.25,
            },
            last_lf_smoothing_band: 5,
            last_lf_band: 5,
            first_hf_band: 8,
            high_bands_suppression: HighBandsSuppression::default(),
            high_frequency_suppression: HighFrequencySuppression::default(),
            floor_first_increase: 0.00001,
        }
    }
}

//! Aggregated echo and filter state.
//!
//! Collects the per-block observations of the linear canceller and the
//! render signal into the flags and estimates the rest of the echo remover
//! keys its decisions on: whether the linear filter can be trusted, where the
//! direct echo path sits in the filter, how strong the echo path is and
//! whether the echo may be saturated.

use crate::block::Block;
use crate::common::{BLOCK_SIZE, FFT_LENGTH_BY_2, FFT_LENGTH_BY_2_PLUS_1, NUM_BLOCKS_PER_SECOND};
use crate::config::EchoRemoverConfig;
use crate::delay_estimate::DelayEstimate;
use crate::echo_path_variability::{DelayAdjustment, EchoPathVariability};
use crate::erl_estimator::ErlEstimator;
use crate::erle_estimator::ErleEstimator;
use crate::render_buffer::RenderBuffer;
use crate::subtractor_output::SubtractorOutput;
use crate::subtractor_output_analyzer::SubtractorOutputAnalyzer;

/// Controls the transition from the initial state parameter set.
#[derive(Debug)]
struct InitialState {
    initial_state_seconds: f32,
    transition_triggered: bool,
    initial_state: bool,
    strong_not_saturated_render_blocks: usize,
}

impl InitialState {
    fn new(config: &EchoRemoverConfig) -> Self {
        Self {
            initial_state_seconds: config.filter.initial_state_seconds,
            transition_triggered: false,
            initial_state: true,
            strong_not_saturated_render_blocks: 0,
        }
    }

    fn reset(&mut self) {
        self.initial_state = true;
        self.strong_not_saturated_render_blocks = 0;
    }

    fn update(&mut self, active_render: bool, saturated_capture: bool) {
        if active_render && !saturated_capture {
            self.strong_not_saturated_render_blocks += 1;
        }

        let prev_initial_state = self.initial_state;
        self.initial_state = (self.strong_not_saturated_render_blocks as f32)
            < self.initial_state_seconds * NUM_BLOCKS_PER_SECOND as f32;
        self.transition_triggered = !self.initial_state && prev_initial_state;
    }
}

/// Direct-path delay of the filters, in blocks.
#[derive(Debug)]
struct FilterDelay {
    delay_headroom_blocks: usize,
    filter_delays_blocks: Vec<usize>,
    min_filter_delay: usize,
    external_delay: Option<DelayEstimate>,
}

impl FilterDelay {
    fn new(config: &EchoRemoverConfig, num_capture_channels: usize) -> Self {
        let delay_headroom_blocks = config.delay.delay_headroom_samples / BLOCK_SIZE;
        Self {
            delay_headroom_blocks,
            filter_delays_blocks: vec![delay_headroom_blocks; num_capture_channels],
            min_filter_delay: delay_headroom_blocks,
            external_delay: None,
        }
    }

    fn update(
        &mut self,
        impulse_responses: &[Vec<f32>],
        external_delay: Option<&DelayEstimate>,
        blocks_with_proper_filter_adaptation: usize,
    ) {
        if let Some(ext) = external_delay {
            if self.external_delay.is_none_or(|current| current.delay != ext.delay) {
                self.external_delay = Some(*ext);
            }
        }

        let delay_estimator_may_not_have_converged =
            blocks_with_proper_filter_adaptation < 2 * NUM_BLOCKS_PER_SECOND;
        if delay_estimator_may_not_have_converged && self.external_delay.is_some() {
            self.filter_delays_blocks.fill(self.delay_headroom_blocks);
        } else {
            debug_assert_eq!(self.filter_delays_blocks.len(), impulse_responses.len());
            for (delay, h) in self.filter_delays_blocks.iter_mut().zip(impulse_responses) {
                *delay = peak_index(h) / BLOCK_SIZE;
            }
        }

        self.min_filter_delay = self
            .filter_delays_blocks
            .iter()
            .copied()
            .min()
            .unwrap_or(self.delay_headroom_blocks);
    }
}

fn peak_index(h: &[f32]) -> usize {
    h.iter()
        .enumerate()
        .fold((0, 0.0f32), |(best, best_abs), (i, &v)| {
            if v.abs() > best_abs { (i, v.abs()) } else { (best, best_abs) }
        })
        .0
}

/// Decides whether the linear filter has adapted long enough to be used.
#[derive(Debug)]
struct FilteringQualityAnalyzer {
    use_linear_filter: bool,
    overall_usable_linear_estimates: bool,
    filter_update_blocks_since_reset: usize,
    filter_update_blocks_since_start: usize,
    convergence_seen: bool,
}

impl FilteringQualityAnalyzer {
    fn new(config: &EchoRemoverConfig) -> Self {
        Self {
            use_linear_filter: config.filter.use_linear_filter,
            overall_usable_linear_estimates: false,
            filter_update_blocks_since_reset: 0,
            filter_update_blocks_since_start: 0,
            convergence_seen: false,
        }
    }

    fn linear_filter_usable(&self) -> bool {
        self.overall_usable_linear_estimates
    }

    fn reset(&mut self) {
        self.overall_usable_linear_estimates = false;
        self.filter_update_blocks_since_reset = 0;
    }

    fn update(
        &mut self,
        active_render: bool,
        saturated_capture: bool,
        external_delay_reported: bool,
        any_filter_converged: bool,
    ) {
        if active_render && !saturated_capture {
            self.filter_update_blocks_since_reset += 1;
            self.filter_update_blocks_since_start += 1;
        }

        self.convergence_seen |= any_filter_converged;

        let sufficient_data_to_converge_at_startup =
            self.filter_update_blocks_since_start as f32 > NUM_BLOCKS_PER_SECOND as f32 * 0.4;
        let sufficient_data_to_converge_at_reset = sufficient_data_to_converge_at_startup
            && self.filter_update_blocks_since_reset as f32 > NUM_BLOCKS_PER_SECOND as f32 * 0.2;

        self.overall_usable_linear_estimates = self.use_linear_filter
            && sufficient_data_to_converge_at_reset
            && (external_delay_reported || self.convergence_seen);
    }
}

/// Flags echo that may have clipped in the capture path.
#[derive(Debug, Default)]
struct SaturationDetector {
    saturated_echo: bool,
}

impl SaturationDetector {
    fn update(
        &mut self,
        x: &Block,
        saturated_capture: bool,
        usable_linear_estimate: bool,
        subtractor_output: &[SubtractorOutput],
        echo_path_gain: f32,
    ) {
        self.saturated_echo = false;
        if !saturated_capture {
            return;
        }

        if usable_linear_estimate {
            const SATURATION_THRESHOLD: f32 = 20000.0;
            self.saturated_echo = subtractor_output.iter().any(|output| {
                output.s_main_max_abs > SATURATION_THRESHOLD
                    || output.s_shadow_max_abs > SATURATION_THRESHOLD
            });
        } else {
            let max_sample = (0..x.num_channels())
                .flat_map(|ch| x.view(0, ch).iter())
                .fold(0.0f32, |max, &sample| max.max(sample.abs()));

            const MARGIN: f32 = 10.0;
            let peak_echo_amplitude = max_sample * echo_path_gain * MARGIN;
            self.saturated_echo = peak_echo_amplitude > 32000.0;
        }
    }
}

/// Default aggregated state of the echo remover.
#[derive(Debug)]
pub struct AecState {
    config: EchoRemoverConfig,
    num_capture_channels: usize,
    initial_state: InitialState,
    delay_state: FilterDelay,
    filter_quality_state: FilteringQualityAnalyzer,
    saturation_detector: SaturationDetector,
    erl_estimator: ErlEstimator,
    erle_estimator: ErleEstimator,
    strong_not_saturated_render_blocks: usize,
    blocks_with_active_render: usize,
    capture_signal_saturation: bool,
    subtractor_output_analyzer: SubtractorOutputAnalyzer,
    avg_render_spectrum: [f32; FFT_LENGTH_BY_2_PLUS_1],
}

impl AecState {
    pub fn new(config: &EchoRemoverConfig, num_capture_channels: usize) -> Self {
        Self {
            config: config.clone(),
            num_capture_channels,
            initial_state: InitialState::new(config),
            delay_state: FilterDelay::new(config, num_capture_channels),
            filter_quality_state: FilteringQualityAnalyzer::new(config),
            saturation_detector: SaturationDetector::default(),
            erl_estimator: ErlEstimator::new(2 * NUM_BLOCKS_PER_SECOND),
            erle_estimator: ErleEstimator::new(
                2 * NUM_BLOCKS_PER_SECOND,
                &config.erle,
                num_capture_channels,
            ),
            strong_not_saturated_render_blocks: 0,
            blocks_with_active_render: 0,
            capture_signal_saturation: false,
            subtractor_output_analyzer: SubtractorOutputAnalyzer::new(num_capture_channels),
            avg_render_spectrum: [0.0; FFT_LENGTH_BY_2_PLUS_1],
        }
    }

    /// Whether the linear echo estimate can be used for residual echo
    /// estimation.
    pub fn usable_linear_estimate(&self) -> bool {
        self.filter_quality_state.linear_filter_usable() && self.config.filter.use_linear_filter
    }

    /// Whether the linear filter output should replace the capture signal.
    pub fn use_linear_filter_output(&self) -> bool {
        self.filter_quality_state.linear_filter_usable() && self.config.filter.use_linear_filter
    }

    pub fn active_render(&self) -> bool {
        self.blocks_with_active_render > 200
    }

    pub fn erle(&self) -> &[[f32; FFT_LENGTH_BY_2_PLUS_1]] {
        self.erle_estimator.erle()
    }

    pub fn fullband_erle_log2(&self) -> f32 {
        self.erle_estimator.fullband_erle_log2()
    }

    pub fn erl(&self) -> &[f32; FFT_LENGTH_BY_2_PLUS_1] {
        self.erl_estimator.erl()
    }

    pub fn erl_time_domain(&self) -> f32 {
        self.erl_estimator.erl_time_domain()
    }

    /// Smallest direct-path delay over all capture channels.
    pub fn filter_delay_blocks(&self) -> usize {
        self.delay_state.min_filter_delay
    }

    pub fn saturated_capture(&self) -> bool {
        self.capture_signal_saturation
    }

    pub fn saturated_echo(&self) -> bool {
        self.saturation_detector.saturated_echo
    }

    pub fn update_capture_saturation(&mut self, capture_signal_saturation: bool) {
        self.capture_signal_saturation = capture_signal_saturation;
    }

    pub fn initial_state(&self) -> bool {
        self.initial_state.initial_state
    }

    /// True only on the block where the initial state ended.
    pub fn transition_triggered(&self) -> bool {
        self.initial_state.transition_triggered
    }

    /// A delay change restarts every estimate; a gain change only the ERLE.
    pub fn handle_echo_path_change(&mut self, echo_path_variability: &EchoPathVariability) {
        if echo_path_variability.delay_change != DelayAdjustment::None {
            self.capture_signal_saturation = false;
            self.strong_not_saturated_render_blocks = 0;
            self.blocks_with_active_render = 0;
            self.initial_state.reset();
            self.erle_estimator.reset(true);
            self.erl_estimator.reset();
            self.filter_quality_state.reset();
        } else if echo_path_variability.gain_change {
            self.erle_estimator.reset(false);
        }
        self.subtractor_output_analyzer.handle_echo_path_change();
    }

    pub fn update(
        &mut self,
        external_delay: Option<&DelayEstimate>,
        adaptive_filter_frequency_responses: &[Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>],
        adaptive_filter_impulse_responses: &[Vec<f32>],
        render_buffer: &RenderBuffer,
        e2_main: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        y2: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        subtractor_output: &[SubtractorOutput],
    ) {
        debug_assert_eq!(self.num_capture_channels, y2.len());
        debug_assert_eq!(self.num_capture_channels, e2_main.len());
        debug_assert_eq!(self.num_capture_channels, subtractor_output.len());
        debug_assert_eq!(self.num_capture_channels, adaptive_filter_frequency_responses.len());

        let convergence = self.subtractor_output_analyzer.update(subtractor_output);

        if self.config.filter.use_linear_filter {
            self.delay_state.update(
                adaptive_filter_impulse_responses,
                external_delay,
                self.strong_not_saturated_render_blocks,
            );
        }

        let delay = self.delay_state.min_filter_delay;
        let aligned_render_block = render_buffer.block(delay);

        let active_render_threshold = self.config.render_levels.active_render_limit
            * self.config.render_levels.active_render_limit
            * FFT_LENGTH_BY_2 as f32;
        let active_render = (0..aligned_render_block.num_channels()).any(|ch| {
            let energy: f32 = aligned_render_block.view(0, ch).iter().map(|&v| v * v).sum();
            energy > active_render_threshold
        });
        if active_render {
            self.blocks_with_active_render += 1;
            if !self.saturated_capture() {
                self.strong_not_saturated_render_blocks += 1;
            }
        }

        let render_spectra = render_buffer.spectrum(delay);
        let normalizer = 1.0 / render_spectra.len() as f32;
        self.avg_render_spectrum.fill(0.0);
        for spectrum in render_spectra {
            for (avg, &x2) in self.avg_render_spectrum.iter_mut().zip(spectrum.iter()) {
                *avg += x2 * normalizer;
            }
        }

        if self.initial_state.transition_triggered {
            self.erle_estimator.reset(false);
        }
        self.erle_estimator.update(
            &self.avg_render_spectrum,
            y2,
            e2_main,
            self.subtractor_output_analyzer.converged_filters(),
        );
        self.erl_estimator.update(
            self.subtractor_output_analyzer.converged_filters(),
            render_spectra,
            y2,
        );

        if self.config.ep_strength.echo_can_saturate {
            let usable_linear_estimate = self.usable_linear_estimate();
            self.saturation_detector.update(
                aligned_render_block,
                self.capture_signal_saturation,
                usable_linear_estimate,
                subtractor_output,
                self.config.ep_strength.default_gain,
            );
        } else {
            debug_assert!(!self.saturation_detector.saturated_echo);
        }

        self.initial_state.update(active_render, self.capture_signal_saturation);

        self.filter_quality_state.update(
            active_render,
            self.capture_signal_saturation,
            self.delay_state.external_delay.is_some(),
            convergence.any_filter_converged,
        );
    }
}

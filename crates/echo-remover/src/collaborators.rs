//! Interfaces between the echo remover and the components it drives.
//!
//! Every trait is object safe so that [`crate::EchoRemover`] can hold its
//! collaborators as boxed trait objects. The crate's own components implement
//! them by delegating to their inherent methods.

use crate::aec_state::AecState;
use crate::block::Block;
use crate::comfort_noise_generator::ComfortNoiseGenerator;
use crate::common::FFT_LENGTH_BY_2_PLUS_1;
use crate::delay_estimate::DelayEstimate;
use crate::echo_path_variability::EchoPathVariability;
use crate::fft_data::FftData;
use crate::render_buffer::RenderBuffer;
use crate::render_signal_analyzer::RenderSignalAnalyzer;
use crate::residual_echo_estimator::ResidualEchoEstimator;
use crate::subtractor::Subtractor;
use crate::subtractor_output::SubtractorOutput;
use crate::suppression_filter::SuppressionFilter;
use crate::suppression_gain::SuppressionGain;

/// Power spectrum of one channel.
pub type Spectrum = [f32; FFT_LENGTH_BY_2_PLUS_1];

/// Linear echo canceller producing main and shadow cancelled signals.
pub trait LinearCanceller {
    fn handle_echo_path_change(&mut self, echo_path_variability: &EchoPathVariability);

    /// Switches from the initial to the steady-state adaptation parameters.
    fn exit_initial_state(&mut self);

    fn process(
        &mut self,
        render_buffer: &RenderBuffer,
        capture: &Block,
        render_analyzer: &dyn RenderAnalyzer,
        state: &dyn EchoState,
        outputs: &mut [SubtractorOutput],
    );

    /// Per capture channel, the frequency response of each main filter
    /// partition.
    fn filter_frequency_responses(&self) -> &[Vec<Spectrum>];

    /// Per capture channel, the time-domain main filter.
    fn filter_impulse_responses(&self) -> &[Vec<f32>];
}

/// Aggregated echo path and filter state.
pub trait EchoState {
    fn update_capture_saturation(&mut self, capture_signal_saturation: bool);

    fn handle_echo_path_change(&mut self, echo_path_variability: &EchoPathVariability);

    #[allow(clippy::too_many_arguments)]
    fn update(
        &mut self,
        external_delay: Option<&DelayEstimate>,
        filter_frequency_responses: &[Vec<Spectrum>],
        filter_impulse_responses: &[Vec<f32>],
        render_buffer: &RenderBuffer,
        e2_main: &[Spectrum],
        y2: &[Spectrum],
        subtractor_output: &[SubtractorOutput],
    );

    /// True on the block where the initial state ends.
    fn transition_triggered(&self) -> bool;
    fn use_linear_filter_output(&self) -> bool;
    fn usable_linear_estimate(&self) -> bool;
    fn filter_delay_blocks(&self) -> usize;
    /// Echo power relative to render power, linear scale.
    fn erl_time_domain(&self) -> f32;
    fn fullband_erle_log2(&self) -> f32;
    fn saturated_capture(&self) -> bool;
    fn saturated_echo(&self) -> bool;
    fn erl(&self) -> &Spectrum;
    /// Per capture channel ERLE.
    fn erle(&self) -> &[Spectrum];
    fn active_render(&self) -> bool;
    fn initial_state(&self) -> bool;
}

/// Analysis of the render signal's spectral content.
pub trait RenderAnalyzer {
    fn update(&mut self, render_buffer: &RenderBuffer, delay_partitions: Option<usize>);
    /// Band index of a strong narrowband render component, if any.
    fn narrow_peak_band(&self) -> Option<usize>;
    fn poor_signal_excitation(&self) -> bool;
}

/// Estimator of the echo power left after linear cancellation.
pub trait ResidualEstimator {
    fn estimate(
        &mut self,
        state: &dyn EchoState,
        render_buffer: &RenderBuffer,
        s2_linear: &[Spectrum],
        y2: &[Spectrum],
        r2: &mut [Spectrum],
    );
}

/// Background noise tracker and comfort noise source.
pub trait ComfortNoise {
    fn compute(
        &mut self,
        state: &dyn EchoState,
        capture_spectrum: &[Spectrum],
        lower_band_noise: &mut [FftData],
        upper_band_noise: &mut [FftData],
    );
    fn noise_spectrum(&self) -> &[Spectrum];
}

/// Computes the suppression gains.
pub trait GainComputer {
    fn set_initial_state(&mut self, state: bool);

    /// Writes the lower band gain into `low_band_gain` and returns the gain
    /// for the upper bands.
    #[allow(clippy::too_many_arguments)]
    fn get_gain(
        &mut self,
        nearend_spectrum: &[Spectrum],
        echo_spectrum: &[Spectrum],
        residual_echo_spectrum: &[Spectrum],
        comfort_noise_spectrum: &[Spectrum],
        render_analyzer: &dyn RenderAnalyzer,
        state: &dyn EchoState,
        render: &Block,
        echo_leakage_detected: bool,
        low_band_gain: &mut Spectrum,
    ) -> f32;
}

/// Applies the gains and forms the output block.
pub trait OutputSynthesis {
    fn apply_gain(
        &mut self,
        comfort_noise: &[FftData],
        comfort_noise_high_band: &[FftData],
        suppression_gain: &Spectrum,
        high_bands_gain: f32,
        e_lowest_band: &[FftData],
        e: &mut Block,
    );
}

impl LinearCanceller for Subtractor {
    fn handle_echo_path_change(&mut self, echo_path_variability: &EchoPathVariability) {
        Subtractor::handle_echo_path_change(self, echo_path_variability);
    }

    fn exit_initial_state(&mut self) {
        Subtractor::exit_initial_state(self);
    }

    fn process(
        &mut self,
        render_buffer: &RenderBuffer,
        capture: &Block,
        _render_analyzer: &dyn RenderAnalyzer,
        state: &dyn EchoState,
        outputs: &mut [SubtractorOutput],
    ) {
        Subtractor::process(self, render_buffer, capture, state.saturated_capture(), outputs);
    }

    fn filter_frequency_responses(&self) -> &[Vec<Spectrum>] {
        Subtractor::filter_frequency_responses(self)
    }

    fn filter_impulse_responses(&self) -> &[Vec<f32>] {
        Subtractor::filter_impulse_responses(self)
    }
}

impl EchoState for AecState {
    fn update_capture_saturation(&mut self, capture_signal_saturation: bool) {
        AecState::update_capture_saturation(self, capture_signal_saturation);
    }

    fn handle_echo_path_change(&mut self, echo_path_variability: &EchoPathVariability) {
        AecState::handle_echo_path_change(self, echo_path_variability);
    }

    fn update(
        &mut self,
        external_delay: Option<&DelayEstimate>,
        filter_frequency_responses: &[Vec<Spectrum>],
        filter_impulse_responses: &[Vec<f32>],
        render_buffer: &RenderBuffer,
        e2_main: &[Spectrum],
        y2: &[Spectrum],
        subtractor_output: &[SubtractorOutput],
    ) {
        AecState::update(
            self,
            external_delay,
            filter_frequency_responses,
            filter_impulse_responses,
            render_buffer,
            e2_main,
            y2,
            subtractor_output,
        );
    }

    fn transition_triggered(&self) -> bool {
        AecState::transition_triggered(self)
    }

    fn use_linear_filter_output(&self) -> bool {
        AecState::use_linear_filter_output(self)
    }

    fn usable_linear_estimate(&self) -> bool {
        AecState::usable_linear_estimate(self)
    }

    fn filter_delay_blocks(&self) -> usize {
        AecState::filter_delay_blocks(self)
    }

    fn erl_time_domain(&self) -> f32 {
        AecState::erl_time_domain(self)
    }

    fn fullband_erle_log2(&self) -> f32 {
        AecState::fullband_erle_log2(self)
    }

    fn saturated_capture(&self) -> bool {
        AecState::saturated_capture(self)
    }

    fn saturated_echo(&self) -> bool {
        AecState::saturated_echo(self)
    }

    fn erl(&self) -> &Spectrum {
        AecState::erl(self)
    }

    fn erle(&self) -> &[Spectrum] {
        AecState::erle(self)
    }

    fn active_render(&self) -> bool {
        AecState::active_render(self)
    }

    fn initial_state(&self) -> bool {
        AecState::initial_state(self)
    }
}

impl RenderAnalyzer for RenderSignalAnalyzer {
    fn update(&mut self, render_buffer: &RenderBuffer, delay_partitions: Option<usize>) {
        RenderSignalAnalyzer::update(self, render_buffer, delay_partitions);
    }

    fn narrow_peak_band(&self) -> Option<usize> {
        RenderSignalAnalyzer::narrow_peak_band(self)
    }

    fn poor_signal_excitation(&self) -> bool {
        RenderSignalAnalyzer::poor_signal_excitation(self)
    }
}

impl ResidualEstimator for ResidualEchoEstimator {
    fn estimate(
        &mut self,
        state: &dyn EchoState,
        render_buffer: &RenderBuffer,
        s2_linear: &[Spectrum],
        y2: &[Spectrum],
        r2: &mut [Spectrum],
    ) {
        ResidualEchoEstimator::estimate(self, state, render_buffer, s2_linear, y2, r2);
    }
}

impl ComfortNoise for ComfortNoiseGenerator {
    fn compute(
        &mut self,
        state: &dyn EchoState,
        capture_spectrum: &[Spectrum],
        lower_band_noise: &mut [FftData],
        upper_band_noise: &mut [FftData],
    ) {
        ComfortNoiseGenerator::compute(
            self,
            state,
            capture_spectrum,
            lower_band_noise,
            upper_band_noise,
        );
    }

    fn noise_spectrum(&self) -> &[Spectrum] {
        ComfortNoiseGenerator::noise_spectrum(self)
    }
}

impl GainComputer for SuppressionGain {
    fn set_initial_state(&mut self, state: bool) {
        SuppressionGain::set_initial_state(self, state);
    }

    fn get_gain(
        &mut self,
        nearend_spectrum: &[Spectrum],
        echo_spectrum: &[Spectrum],
        residual_echo_spectrum: &[Spectrum],
        comfort_noise_spectrum: &[Spectrum],
        render_analyzer: &dyn RenderAnalyzer,
        state: &dyn EchoState,
        render: &Block,
        echo_leakage_detected: bool,
        low_band_gain: &mut Spectrum,
    ) -> f32 {
        SuppressionGain::get_gain(
            self,
            nearend_spectrum,
            echo_spectrum,
            residual_echo_spectrum,
            comfort_noise_spectrum,
            render_analyzer,
            state,
            render,
            echo_leakage_detected,
            low_band_gain,
        )
    }
}

impl OutputSynthesis for SuppressionFilter {
    fn apply_gain(
        &mut self,
        comfort_noise: &[FftData],
        comfort_noise_high_band: &[FftData],
        suppression_gain: &Spectrum,
        high_bands_gain: f32,
        e_lowest_band: &[FftData],
        e: &mut Block,
    ) {
        SuppressionFilter::apply_gain(
            self,
            comfort_noise,
            comfort_noise_high_band,
            suppression_gain,
            high_bands_gain,
            e_lowest_band,
            e,
        );
    }
}

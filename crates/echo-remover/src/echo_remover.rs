//! Echo remover: drives linear cancellation, residual echo suppression and
//! comfort noise for one capture block at a time.

use crate::aec_state::AecState;
use crate::block::Block;
use crate::block_fft::{BlockFft, Window};
use crate::channels::ChannelBuffer;
use crate::collaborators::{
    ComfortNoise, EchoState, GainComputer, LinearCanceller, OutputSynthesis, RenderAnalyzer,
    ResidualEstimator, Spectrum,
};
use crate::comfort_noise_generator::ComfortNoiseGenerator;
use crate::common::{
    BLOCK_SIZE, FFT_LENGTH_BY_2, FFT_LENGTH_BY_2_PLUS_1, log2_to_db, num_bands_for_rate,
    valid_full_band_rate,
};
use crate::config::EchoRemoverConfig;
use crate::delay_estimate::DelayEstimate;
use crate::echo_path_variability::{DelayAdjustment, EchoPathVariability};
use crate::echo_remover_metrics::EchoRemoverMetrics;
use crate::error::Error;
use crate::fft_data::FftData;
use crate::render_buffer::RenderBuffer;
use crate::render_signal_analyzer::RenderSignalAnalyzer;
use crate::residual_echo_estimator::ResidualEchoEstimator;
use crate::selector::{FilterOutput, OutputSelector, ProcessingPath, Transition, blend};
use crate::subtractor::Subtractor;
use crate::subtractor_output::SubtractorOutput;
use crate::suppression_filter::SuppressionFilter;
use crate::suppression_gain::SuppressionGain;

/// Number of blocks a gain change stays latched, so that one change reported
/// for every block of a frame is acted on once.
const GAIN_CHANGE_HANGOVER_BLOCKS: i32 = 3;

/// The shadow filter output must beat the main output by this factor.
const SHADOW_SELECTION_MARGIN: f32 = 0.9;
/// Capture energy per block above which a better shadow filter is trusted.
const SHADOW_SELECTION_CAPTURE_ENERGY: f32 = 30.0 * 30.0 * BLOCK_SIZE as f32;
/// Echo estimate energy per block above which a better shadow filter is
/// trusted.
const SHADOW_SELECTION_ECHO_ENERGY: f32 = 60.0 * 60.0 * BLOCK_SIZE as f32;

/// Echo quality metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EchoMetrics {
    /// Echo return loss in dB.
    pub echo_return_loss: f64,
    /// Echo return loss enhancement in dB.
    pub echo_return_loss_enhancement: f64,
}

impl EchoMetrics {
    fn from_state(state: &dyn EchoState) -> Self {
        Self {
            // The ERL is inverted to go from gain to attenuation.
            echo_return_loss: -10.0 * f64::from(state.erl_time_domain()).log10(),
            echo_return_loss_enhancement: f64::from(log2_to_db(state.fullband_erle_log2())),
        }
    }
}

/// The collaborators an [`EchoRemover`] drives.
#[derive(derive_more::Debug)]
pub struct Components {
    #[debug(skip)]
    pub canceller: Box<dyn LinearCanceller>,
    #[debug(skip)]
    pub state: Box<dyn EchoState>,
    #[debug(skip)]
    pub render_analyzer: Box<dyn RenderAnalyzer>,
    #[debug(skip)]
    pub residual_estimator: Box<dyn ResidualEstimator>,
    #[debug(skip)]
    pub comfort_noise: Box<dyn ComfortNoise>,
    #[debug(skip)]
    pub gain: Box<dyn GainComputer>,
    #[debug(skip)]
    pub synthesis: Box<dyn OutputSynthesis>,
}

impl Components {
    /// Builds the crate's own implementation of every collaborator.
    pub fn defaults(
        config: &EchoRemoverConfig,
        sample_rate_hz: usize,
        num_render_channels: usize,
        num_capture_channels: usize,
    ) -> Self {
        Self {
            canceller: Box::new(Subtractor::new(
                config,
                num_render_channels,
                num_capture_channels,
            )),
            state: Box::new(AecState::new(config, num_capture_channels)),
            render_analyzer: Box::new(RenderSignalAnalyzer::new(config)),
            residual_estimator: Box::new(ResidualEchoEstimator::new(config)),
            comfort_noise: Box::new(ComfortNoiseGenerator::new(config, num_capture_channels)),
            gain: Box::new(SuppressionGain::new(config, num_capture_channels)),
            synthesis: Box::new(SuppressionFilter::new(sample_rate_hz, num_capture_channels)),
        }
    }
}

/// Computes the linear echo power `|Y - E|^2`.
fn linear_echo_power(e: &FftData, y: &FftData, s2: &mut Spectrum) {
    for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
        let re = y.re[k] - e.re[k];
        let im = y.im[k] - e.im[k];
        s2[k] = re * re + im * im;
    }
}

fn select_filter_output(use_shadow_filter_output: bool, output: &SubtractorOutput) -> FilterOutput {
    if !use_shadow_filter_output {
        return FilterOutput::Main;
    }
    // The main filter output is generally the better one, so the shadow
    // output needs a margin and enough signal to be chosen.
    if output.e2_shadow_sum < SHADOW_SELECTION_MARGIN * output.e2_main_sum
        && output.y2 > SHADOW_SELECTION_CAPTURE_ENERGY
        && (output.s2_main > SHADOW_SELECTION_ECHO_ENERGY
            || output.s2_shadow > SHADOW_SELECTION_ECHO_ENERGY)
    {
        return FilterOutput::Shadow;
    }
    // A diverged main filter loses to the lower-power output.
    if output.e2_shadow_sum < output.e2_main_sum && output.y2 < output.e2_main_sum {
        return FilterOutput::Shadow;
    }
    FilterOutput::Main
}

fn filter_signal(output: &SubtractorOutput, which: FilterOutput) -> &[f32; BLOCK_SIZE] {
    match which {
        FilterOutput::Main => &output.e_main,
        FilterOutput::Shadow => &output.e_shadow,
    }
}

/// Forms the linear filter output, crossfading when the selected filter
/// changes.
fn form_linear_filter_output(
    selector: &mut OutputSelector<FilterOutput>,
    use_shadow_filter_output: bool,
    output: &SubtractorOutput,
    e: &mut [f32; BLOCK_SIZE],
) {
    match selector.select(select_filter_output(use_shadow_filter_output, output)) {
        Transition::Cut(which) => e.copy_from_slice(filter_signal(output, which)),
        Transition::Crossfade { from, to } => {
            blend(filter_signal(output, from), filter_signal(output, to), e)
        }
    }
}

/// Removes echo from capture blocks.
///
/// Owns one set of collaborators for its whole lifetime. Channel and band
/// counts are fixed at construction and every call must match them.
#[derive(derive_more::Debug)]
pub struct EchoRemover {
    config: EchoRemoverConfig,
    instance_id: usize,
    sample_rate_hz: usize,
    num_bands: usize,
    num_render_channels: usize,
    num_capture_channels: usize,
    use_shadow_filter_output: bool,
    #[debug(skip)]
    fft: BlockFft,

    #[debug(skip)]
    canceller: Box<dyn LinearCanceller>,
    #[debug(skip)]
    state: Box<dyn EchoState>,
    #[debug(skip)]
    analyzer: Box<dyn RenderAnalyzer>,
    #[debug(skip)]
    residual: Box<dyn ResidualEstimator>,
    #[debug(skip)]
    noise: Box<dyn ComfortNoise>,
    #[debug(skip)]
    gain: Box<dyn GainComputer>,
    #[debug(skip)]
    synthesis: Box<dyn OutputSynthesis>,
    metrics: EchoRemoverMetrics,

    echo_leakage_detected: bool,
    capture_output_used: bool,
    block_counter: usize,
    gain_change_hangover: i32,
    filter_selectors: ChannelBuffer<OutputSelector<FilterOutput>>,
    path_selector: OutputSelector<ProcessingPath>,

    // Overlap tails carried between blocks.
    #[debug(skip)]
    y_old: ChannelBuffer<[f32; FFT_LENGTH_BY_2]>,
    #[debug(skip)]
    e_old: ChannelBuffer<[f32; FFT_LENGTH_BY_2]>,

    // Per-block working storage.
    #[debug(skip)]
    subtractor_output: ChannelBuffer<SubtractorOutput>,
    #[debug(skip)]
    e: ChannelBuffer<[f32; BLOCK_SIZE]>,
    #[debug(skip)]
    y_fft: ChannelBuffer<FftData>,
    #[debug(skip)]
    e_fft: ChannelBuffer<FftData>,
    #[debug(skip)]
    y2: ChannelBuffer<Spectrum>,
    #[debug(skip)]
    e2: ChannelBuffer<Spectrum>,
    #[debug(skip)]
    r2: ChannelBuffer<Spectrum>,
    #[debug(skip)]
    s2_linear: ChannelBuffer<Spectrum>,
    #[debug(skip)]
    nearend_bounded: ChannelBuffer<Spectrum>,
    #[debug(skip)]
    comfort_noise: ChannelBuffer<FftData>,
    #[debug(skip)]
    high_band_comfort_noise: ChannelBuffer<FftData>,
    #[debug(skip)]
    g: Spectrum,
}

impl EchoRemover {
    /// Creates an echo remover with the default collaborators.
    pub fn new(
        config: &EchoRemoverConfig,
        sample_rate_hz: usize,
        num_render_channels: usize,
        num_capture_channels: usize,
        instance_id: usize,
    ) -> Result<Self, Error> {
        let config = checked_config(config, sample_rate_hz, num_render_channels, num_capture_channels)?;
        let components = Components::defaults(
            &config,
            sample_rate_hz,
            num_render_channels,
            num_capture_channels,
        );
        Ok(Self::assemble(
            config,
            sample_rate_hz,
            num_render_channels,
            num_capture_channels,
            instance_id,
            components,
        ))
    }

    /// Creates an echo remover driving the given collaborators.
    pub fn with_components(
        config: &EchoRemoverConfig,
        sample_rate_hz: usize,
        num_render_channels: usize,
        num_capture_channels: usize,
        instance_id: usize,
        components: Components,
    ) -> Result<Self, Error> {
        let config = checked_config(config, sample_rate_hz, num_render_channels, num_capture_channels)?;
        Ok(Self::assemble(
            config,
            sample_rate_hz,
            num_render_channels,
            num_capture_channels,
            instance_id,
            components,
        ))
    }

    fn assemble(
        config: EchoRemoverConfig,
        sample_rate_hz: usize,
        num_render_channels: usize,
        num_capture_channels: usize,
        instance_id: usize,
        components: Components,
    ) -> Self {
        tracing::debug!(
            instance_id = instance_id,
            sample_rate_hz = sample_rate_hz,
            num_render_channels = num_render_channels,
            num_capture_channels = num_capture_channels,
            "Creating echo remover"
        );
        let spectra = || ChannelBuffer::from_fn(num_capture_channels, |_| [0.0; FFT_LENGTH_BY_2_PLUS_1]);
        let blocks = || ChannelBuffer::from_fn(num_capture_channels, |_| [0.0; BLOCK_SIZE]);
        Self {
            use_shadow_filter_output: config.filter.enable_shadow_filter_output_usage,
            config,
            instance_id,
            sample_rate_hz,
            num_bands: num_bands_for_rate(sample_rate_hz),
            num_render_channels,
            num_capture_channels,
            fft: BlockFft::new(),
            canceller: components.canceller,
            state: components.state,
            analyzer: components.render_analyzer,
            residual: components.residual_estimator,
            noise: components.comfort_noise,
            gain: components.gain,
            synthesis: components.synthesis,
            metrics: EchoRemoverMetrics::new(instance_id),
            echo_leakage_detected: false,
            capture_output_used: true,
            block_counter: 0,
            gain_change_hangover: 0,
            filter_selectors: ChannelBuffer::from_fn(num_capture_channels, |_| {
                OutputSelector::new(FilterOutput::Main)
            }),
            path_selector: OutputSelector::new(ProcessingPath::Linear),
            y_old: blocks(),
            e_old: blocks(),
            subtractor_output: ChannelBuffer::new(num_capture_channels),
            e: blocks(),
            y_fft: ChannelBuffer::new(num_capture_channels),
            e_fft: ChannelBuffer::new(num_capture_channels),
            y2: spectra(),
            e2: spectra(),
            r2: spectra(),
            s2_linear: spectra(),
            nearend_bounded: spectra(),
            comfort_noise: ChannelBuffer::new(num_capture_channels),
            high_band_comfort_noise: ChannelBuffer::new(num_capture_channels),
            g: [0.0; FFT_LENGTH_BY_2_PLUS_1],
        }
    }

    pub fn instance_id(&self) -> usize {
        self.instance_id
    }

    pub fn sample_rate_hz(&self) -> usize {
        self.sample_rate_hz
    }

    /// The validated configuration in use.
    pub fn config(&self) -> &EchoRemoverConfig {
        &self.config
    }

    /// Returns the current echo metrics.
    pub fn metrics(&self) -> EchoMetrics {
        EchoMetrics::from_state(&*self.state)
    }

    /// Updates the status on whether echo leakage is detected in the output.
    pub fn update_echo_leakage_status(&mut self, leakage_detected: bool) {
        self.echo_leakage_detected = leakage_detected;
    }

    /// Specifies whether the capture output will be used. When it is not,
    /// only the path selection and the noise tracking run.
    pub fn set_capture_output_usage(&mut self, capture_output_used: bool) {
        self.capture_output_used = capture_output_used;
    }

    /// Removes the echo from `capture` in place.
    ///
    /// `render_buffer` must already be aligned so that its offset 0 block is
    /// the render block played at the time of the capture. When
    /// `linear_output` is given it receives the linear filter output.
    ///
    /// # Panics
    ///
    /// Panics if the band or channel counts of any argument differ from those
    /// given at construction, or if `render_buffer` holds fewer blocks than
    /// [`RenderBuffer::required_size`].
    pub fn process_capture(
        &mut self,
        mut echo_path_variability: EchoPathVariability,
        capture_signal_saturation: bool,
        external_delay: Option<&DelayEstimate>,
        render_buffer: &RenderBuffer,
        linear_output: Option<&mut Block>,
        capture: &mut Block,
    ) {
        self.block_counter += 1;
        let num_capture_channels = self.num_capture_channels;

        assert_eq!(self.num_bands, render_buffer.num_bands(), "render band count mismatch");
        assert_eq!(self.num_bands, capture.num_bands(), "capture band count mismatch");
        assert_eq!(
            self.num_render_channels,
            render_buffer.num_channels(),
            "render channel count mismatch"
        );
        assert_eq!(
            num_capture_channels,
            capture.num_channels(),
            "capture channel count mismatch"
        );
        assert!(
            render_buffer.size() >= RenderBuffer::required_size(&self.config),
            "render buffer too small: {} blocks, need {}",
            render_buffer.size(),
            RenderBuffer::required_size(&self.config)
        );
        if let Some(linear_output) = linear_output.as_deref() {
            assert_eq!(
                num_capture_channels,
                linear_output.num_channels(),
                "linear output channel count mismatch"
            );
        }

        self.state.update_capture_saturation(capture_signal_saturation);

        if echo_path_variability.audio_path_changed() {
            if echo_path_variability.gain_change {
                if self.gain_change_hangover == 0 {
                    self.gain_change_hangover = GAIN_CHANGE_HANGOVER_BLOCKS;
                    tracing::info!(
                        instance_id = self.instance_id,
                        "Gain change detected at block {}",
                        self.block_counter
                    );
                } else {
                    echo_path_variability.gain_change = false;
                }
            }

            self.canceller.handle_echo_path_change(&echo_path_variability);
            self.state.handle_echo_path_change(&echo_path_variability);

            if echo_path_variability.delay_change != DelayAdjustment::None {
                self.gain.set_initial_state(true);
            }
        }
        if self.gain_change_hangover > 0 {
            self.gain_change_hangover -= 1;
        }

        self.analyzer
            .update(render_buffer, Some(self.state.filter_delay_blocks()));

        if self.state.transition_triggered() {
            self.canceller.exit_initial_state();
            self.gain.set_initial_state(false);
        }

        self.canceller.process(
            render_buffer,
            capture,
            &*self.analyzer,
            &*self.state,
            &mut self.subtractor_output,
        );

        for ch in 0..num_capture_channels {
            form_linear_filter_output(
                &mut self.filter_selectors[ch],
                self.use_shadow_filter_output,
                &self.subtractor_output[ch],
                &mut self.e[ch],
            );

            self.fft.padded_fft_with_tail(
                capture.view(0, ch),
                &mut self.y_old[ch],
                Window::SqrtHanning,
                &mut self.y_fft[ch],
            );
            self.fft.padded_fft_with_tail(
                &self.e[ch],
                &mut self.e_old[ch],
                Window::SqrtHanning,
                &mut self.e_fft[ch],
            );
            linear_echo_power(&self.e_fft[ch], &self.y_fft[ch], &mut self.s2_linear[ch]);
            self.y_fft[ch].spectrum(&mut self.y2[ch]);
            self.e_fft[ch].spectrum(&mut self.e2[ch]);
        }

        if let Some(linear_output) = linear_output {
            for ch in 0..num_capture_channels {
                linear_output.view_mut(0, ch).copy_from_slice(&self.e[ch]);
            }
        }

        self.state.update(
            external_delay,
            self.canceller.filter_frequency_responses(),
            self.canceller.filter_impulse_responses(),
            render_buffer,
            &self.e2,
            &self.y2,
            &self.subtractor_output,
        );

        let use_linear = self.state.use_linear_filter_output();
        self.select_processing_path(use_linear, capture);

        if self.capture_output_used {
            self.residual.estimate(
                &*self.state,
                render_buffer,
                &self.s2_linear,
                &self.y2,
                &mut self.r2,
            );
        }

        self.noise.compute(
            &*self.state,
            &self.y2,
            &mut self.comfort_noise,
            &mut self.high_band_comfort_noise,
        );

        if self.capture_output_used {
            let usable_linear_estimate = self.state.usable_linear_estimate();
            let (echo_spectrum, nearend_spectrum): (&[Spectrum], &[Spectrum]) =
                if usable_linear_estimate {
                    for ((bounded, e2), y2) in self
                        .nearend_bounded
                        .iter_mut()
                        .zip(self.e2.iter())
                        .zip(self.y2.iter())
                    {
                        for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
                            bounded[k] = e2[k].min(y2[k]);
                        }
                    }
                    (&self.s2_linear, &self.nearend_bounded)
                } else {
                    (&self.r2, &self.y2)
                };

            let high_bands_gain = self.gain.get_gain(
                nearend_spectrum,
                echo_spectrum,
                &self.r2,
                self.noise.noise_spectrum(),
                &*self.analyzer,
                &*self.state,
                render_buffer.block(0),
                self.echo_leakage_detected,
                &mut self.g,
            );

            let suppression_input: &[FftData] = if use_linear { &self.e_fft } else { &self.y_fft };
            self.synthesis.apply_gain(
                &self.comfort_noise,
                &self.high_band_comfort_noise,
                &self.g,
                high_bands_gain,
                suppression_input,
                capture,
            );
        }

        self.metrics.update(&*self.state);

        tracing::trace!(
            instance_id = self.instance_id,
            block = self.block_counter,
            filter_delay_blocks = self.state.filter_delay_blocks(),
            path = ?self.path_selector.selected(),
            saturated_capture = self.state.saturated_capture(),
            narrow_peak_band = ?self.analyzer.narrow_peak_band(),
            metrics_reported = self.metrics.metrics_reported(),
            "Processed capture block"
        );
    }

    /// Replaces the lowest band of `capture` with the linear filter output
    /// when the linear path is selected, crossfading on a change of path.
    fn select_processing_path(&mut self, use_linear: bool, capture: &mut Block) {
        let path = if use_linear {
            ProcessingPath::Linear
        } else {
            ProcessingPath::Original
        };
        let transition = self.path_selector.select(path);
        for ch in 0..self.num_capture_channels {
            let e = &self.e[ch];
            let y = capture.view_mut(0, ch);
            let mut y_in = [0.0f32; BLOCK_SIZE];
            y_in.copy_from_slice(y);
            match transition {
                Transition::Cut(ProcessingPath::Linear) => y.copy_from_slice(e),
                Transition::Cut(ProcessingPath::Original) => {}
                Transition::Crossfade {
                    to: ProcessingPath::Linear,
                    ..
                } => blend(&y_in, e, y),
                Transition::Crossfade {
                    to: ProcessingPath::Original,
                    ..
                } => blend(e, &y_in, y),
            }
        }
    }
}

/// Validates the construction arguments and returns the validated copy of
/// `config`.
fn checked_config(
    config: &EchoRemoverConfig,
    sample_rate_hz: usize,
    num_render_channels: usize,
    num_capture_channels: usize,
) -> Result<EchoRemoverConfig, Error> {
    if !valid_full_band_rate(sample_rate_hz) {
        return Err(Error::BadSampleRate);
    }
    if num_render_channels == 0 || num_capture_channels == 0 {
        return Err(Error::BadNumberChannels);
    }
    let mut config = config.clone();
    if !config.validate() {
        tracing::warn!("Echo remover configuration was adjusted to valid ranges");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::f32::consts::PI;
    use std::rc::Rc;

    use proptest::prelude::*;
    use test_strategy::proptest;

    use super::*;
    use crate::collaborators::test_support::{StaticEchoState, StaticRenderAnalyzer};
    use crate::delay_estimate::DelayEstimateQuality;
    use crate::selector::TRANSITION_SIZE;

    /// Canceller that records the echo path changes it receives and outputs
    /// fixed main and shadow signals.
    #[derive(Default)]
    struct RecordingCanceller {
        changes: Rc<RefCell<Vec<EchoPathVariability>>>,
        initial_state_exits: Rc<Cell<usize>>,
        template: SubtractorOutput,
        frequency_responses: Vec<Vec<Spectrum>>,
        impulse_responses: Vec<Vec<f32>>,
    }

    impl LinearCanceller for RecordingCanceller {
        fn handle_echo_path_change(&mut self, echo_path_variability: &EchoPathVariability) {
            self.changes.borrow_mut().push(*echo_path_variability);
        }

        fn exit_initial_state(&mut self) {
            self.initial_state_exits.set(self.initial_state_exits.get() + 1);
        }

        fn process(
            &mut self,
            _render_buffer: &RenderBuffer,
            _capture: &Block,
            _render_analyzer: &dyn RenderAnalyzer,
            _state: &dyn EchoState,
            outputs: &mut [SubtractorOutput],
        ) {
            for output in outputs {
                *output = self.template.clone();
            }
        }

        fn filter_frequency_responses(&self) -> &[Vec<Spectrum>] {
            &self.frequency_responses
        }

        fn filter_impulse_responses(&self) -> &[Vec<f32>] {
            &self.impulse_responses
        }
    }

    struct NoResidual;

    impl ResidualEstimator for NoResidual {
        fn estimate(
            &mut self,
            _state: &dyn EchoState,
            _render_buffer: &RenderBuffer,
            _s2_linear: &[Spectrum],
            _y2: &[Spectrum],
            r2: &mut [Spectrum],
        ) {
            for r in r2 {
                r.fill(0.0);
            }
        }
    }

    struct SilentNoise {
        n2: Vec<Spectrum>,
    }

    impl ComfortNoise for SilentNoise {
        fn compute(
            &mut self,
            _state: &dyn EchoState,
            _capture_spectrum: &[Spectrum],
            lower_band_noise: &mut [FftData],
            upper_band_noise: &mut [FftData],
        ) {
            lower_band_noise.iter_mut().for_each(FftData::clear);
            upper_band_noise.iter_mut().for_each(FftData::clear);
        }

        fn noise_spectrum(&self) -> &[Spectrum] {
            &self.n2
        }
    }

    struct UnitGain;

    impl GainComputer for UnitGain {
        fn set_initial_state(&mut self, _state: bool) {}

        fn get_gain(
            &mut self,
            _nearend_spectrum: &[Spectrum],
            _echo_spectrum: &[Spectrum],
            _residual_echo_spectrum: &[Spectrum],
            _comfort_noise_spectrum: &[Spectrum],
            _render_analyzer: &dyn RenderAnalyzer,
            _state: &dyn EchoState,
            _render: &Block,
            _echo_leakage_detected: bool,
            low_band_gain: &mut Spectrum,
        ) -> f32 {
            low_band_gain.fill(1.0);
            1.0
        }
    }

    /// Gain inputs of one block, for channel 0.
    #[derive(Debug, Clone)]
    struct GainInputs {
        nearend: Spectrum,
        echo: Spectrum,
    }

    /// Unit gain that records the calls and spectra it receives.
    #[derive(Default)]
    struct RecordingGain {
        initial_state_calls: Rc<RefCell<Vec<bool>>>,
        inputs: Rc<RefCell<Vec<GainInputs>>>,
    }

    impl GainComputer for RecordingGain {
        fn set_initial_state(&mut self, state: bool) {
            self.initial_state_calls.borrow_mut().push(state);
        }

        fn get_gain(
            &mut self,
            nearend_spectrum: &[Spectrum],
            echo_spectrum: &[Spectrum],
            _residual_echo_spectrum: &[Spectrum],
            _comfort_noise_spectrum: &[Spectrum],
            _render_analyzer: &dyn RenderAnalyzer,
            _state: &dyn EchoState,
            _render: &Block,
            _echo_leakage_detected: bool,
            low_band_gain: &mut Spectrum,
        ) -> f32 {
            self.inputs.borrow_mut().push(GainInputs {
                nearend: nearend_spectrum[0],
                echo: echo_spectrum[0],
            });
            low_band_gain.fill(1.0);
            1.0
        }
    }

    fn components(
        canceller: RecordingCanceller,
        state: StaticEchoState,
        gain: Box<dyn GainComputer>,
    ) -> Components {
        let num_channels = state.erle.len();
        Components {
            canceller: Box::new(canceller),
            state: Box::new(state),
            render_analyzer: Box::new(StaticRenderAnalyzer::default()),
            residual_estimator: Box::new(NoResidual),
            comfort_noise: Box::new(SilentNoise {
                n2: vec![[0.0; FFT_LENGTH_BY_2_PLUS_1]; num_channels],
            }),
            gain,
            synthesis: Box::new(SuppressionFilter::new(16000, num_channels)),
        }
    }

    fn fake_components(num_channels: usize, canceller: RecordingCanceller) -> Components {
        components(canceller, StaticEchoState::new(num_channels), Box::new(UnitGain))
    }

    fn recording_canceller(num_channels: usize) -> RecordingCanceller {
        RecordingCanceller {
            frequency_responses: vec![vec![[0.0; FFT_LENGTH_BY_2_PLUS_1]; 13]; num_channels],
            impulse_responses: vec![vec![0.0; 13 * BLOCK_SIZE]; num_channels],
            ..RecordingCanceller::default()
        }
    }

    #[test]
    fn construction_validates_arguments() {
        let config = EchoRemoverConfig::default();
        assert_eq!(
            EchoRemover::new(&config, 8000, 1, 1, 0).unwrap_err(),
            Error::BadSampleRate
        );
        assert_eq!(
            EchoRemover::new(&config, 16000, 0, 1, 0).unwrap_err(),
            Error::BadNumberChannels
        );
        assert_eq!(
            EchoRemover::new(&config, 16000, 1, 0, 0).unwrap_err(),
            Error::BadNumberChannels
        );
        let remover = EchoRemover::new(&config, 48000, 2, 1, 7).unwrap();
        assert_eq!(remover.instance_id(), 7);
        assert_eq!(remover.sample_rate_hz(), 48000);
    }

    #[test]
    fn silence_in_gives_silence_out() {
        let config = EchoRemoverConfig::default();
        for rate in [16000, 32000, 48000] {
            let num_bands = num_bands_for_rate(rate);
            for num_channels in 1..=8 {
                let mut remover = EchoRemover::new(&config, rate, num_channels, num_channels, 0).unwrap();
                let mut render_buffer = RenderBuffer::for_config(&config, num_bands, num_channels);
                let render = Block::new(num_bands, num_channels);
                let mut capture = Block::new(num_bands, num_channels);
                let mut linear = Block::new(1, num_channels);
                for _ in 0..30 {
                    render_buffer.insert(&render);
                    remover.process_capture(
                        EchoPathVariability::default(),
                        false,
                        None,
                        &render_buffer,
                        Some(&mut linear),
                        &mut capture,
                    );
                    for band in 0..num_bands {
                        for ch in 0..num_channels {
                            assert!(
                                capture.view(band, ch).iter().all(|&v| v == 0.0),
                                "rate {rate}, {num_channels} channels, band {band}"
                            );
                        }
                    }
                    assert!(linear.view(0, 0).iter().all(|&v| v == 0.0));
                }
            }
        }
    }

    #[test]
    fn api_calls_with_path_changes() {
        let config = EchoRemoverConfig::default();
        for rate in [16000, 32000, 48000] {
            let num_bands = num_bands_for_rate(rate);
            for (num_render, num_capture) in [(1, 1), (2, 1), (1, 2), (2, 3)] {
                let mut remover = EchoRemover::new(&config, rate, num_render, num_capture, 1).unwrap();
                let mut render_buffer = RenderBuffer::for_config(&config, num_bands, num_render);
                let mut capture = Block::new(num_bands, num_capture);
                for k in 0..100usize {
                    let render = Block::new_with_value(num_bands, num_render, (k % 7) as f32 * 100.0);
                    render_buffer.insert(&render);
                    for ch in 0..num_capture {
                        capture.view_mut(0, ch).fill((k % 5) as f32 * 50.0);
                    }
                    let variability = EchoPathVariability::new(
                        k % 3 == 0,
                        if k % 5 == 0 {
                            DelayAdjustment::NewDetectedDelay
                        } else {
                            DelayAdjustment::None
                        },
                    );
                    remover.set_capture_output_usage(k % 11 != 0);
                    remover.update_echo_leakage_status(k % 13 == 0);
                    remover.process_capture(
                        variability,
                        k % 2 == 0,
                        None,
                        &render_buffer,
                        None,
                        &mut capture,
                    );
                }
                let metrics = remover.metrics();
                assert!(!metrics.echo_return_loss_enhancement.is_nan());
            }
        }
    }

    #[test]
    fn gain_change_reaches_canceller_once() {
        let config = EchoRemoverConfig::default();
        let canceller = recording_canceller(1);
        let changes = Rc::clone(&canceller.changes);
        let mut remover =
            EchoRemover::with_components(&config, 16000, 1, 1, 0, fake_components(1, canceller)).unwrap();
        let render_buffer = RenderBuffer::for_config(&config, 1, 1);
        let mut capture = Block::new(1, 1);

        for _ in 0..3 {
            remover.process_capture(
                EchoPathVariability::new(true, DelayAdjustment::None),
                false,
                None,
                &render_buffer,
                None,
                &mut capture,
            );
        }
        let changes = changes.borrow();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes.iter().filter(|v| v.gain_change).count(), 1);
        assert!(changes[0].gain_change);
    }

    #[test]
    fn gain_change_is_accepted_again_after_hangover() {
        let config = EchoRemoverConfig::default();
        let canceller = recording_canceller(1);
        let changes = Rc::clone(&canceller.changes);
        let mut remover =
            EchoRemover::with_components(&config, 16000, 1, 1, 0, fake_components(1, canceller)).unwrap();
        let render_buffer = RenderBuffer::for_config(&config, 1, 1);
        let mut capture = Block::new(1, 1);

        for k in 0..6 {
            remover.process_capture(
                EchoPathVariability::new(k == 0 || k == 5, DelayAdjustment::None),
                false,
                None,
                &render_buffer,
                None,
                &mut capture,
            );
        }
        assert_eq!(changes.borrow().iter().filter(|v| v.gain_change).count(), 2);
    }

    #[test]
    fn shadow_selection_does_not_oscillate() {
        let config = EchoRemoverConfig::default();
        let mut canceller = recording_canceller(1);
        canceller.template.e_main = [100.0; BLOCK_SIZE];
        canceller.template.e_shadow = [10.0; BLOCK_SIZE];
        canceller.template.e2_main_sum = 100.0 * 100.0 * BLOCK_SIZE as f32;
        canceller.template.e2_shadow_sum = 10.0 * 10.0 * BLOCK_SIZE as f32;
        canceller.template.y2 = 1000.0 * 1000.0 * BLOCK_SIZE as f32;
        canceller.template.s2_main = 1000.0 * 1000.0 * BLOCK_SIZE as f32;

        let mut remover =
            EchoRemover::with_components(&config, 16000, 1, 1, 0, fake_components(1, canceller)).unwrap();
        let render_buffer = RenderBuffer::for_config(&config, 1, 1);
        let mut capture = Block::new(1, 1);
        let mut linear = Block::new(1, 1);

        for k in 0..20 {
            remover.process_capture(
                EchoPathVariability::default(),
                false,
                None,
                &render_buffer,
                Some(&mut linear),
                &mut capture,
            );
            assert_eq!(remover.filter_selectors[0].selected(), FilterOutput::Shadow);
            if k == 0 {
                assert!(linear.view(0, 0)[0] > 10.0 && linear.view(0, 0)[0] < 100.0);
                assert!(linear.view(0, 0)[TRANSITION_SIZE..].iter().all(|&v| v == 10.0));
            } else {
                assert!(linear.view(0, 0).iter().all(|&v| v == 10.0));
            }
        }
    }

    #[test]
    fn main_output_is_kept_without_shadow_usage() {
        let mut config = EchoRemoverConfig::default();
        config.filter.enable_shadow_filter_output_usage = false;
        let mut canceller = recording_canceller(1);
        canceller.template.e_main = [100.0; BLOCK_SIZE];
        canceller.template.e2_main_sum = 1e9;
        canceller.template.y2 = 1.0;

        let mut remover =
            EchoRemover::with_components(&config, 16000, 1, 1, 0, fake_components(1, canceller)).unwrap();
        let render_buffer = RenderBuffer::for_config(&config, 1, 1);
        let mut capture = Block::new(1, 1);
        let mut linear = Block::new(1, 1);
        for _ in 0..5 {
            remover.process_capture(
                EchoPathVariability::default(),
                false,
                None,
                &render_buffer,
                Some(&mut linear),
                &mut capture,
            );
            assert!(linear.view(0, 0).iter().all(|&v| v == 100.0));
        }
    }

    /// Canceller whose main output is the constant `value` with matching
    /// energies, so that the main filter stays selected.
    fn constant_main_canceller(value: f32) -> RecordingCanceller {
        let mut canceller = recording_canceller(1);
        canceller.template.e_main = [value; BLOCK_SIZE];
        canceller.template.e_shadow = [value; BLOCK_SIZE];
        canceller
    }

    fn process_constant_capture(remover: &mut EchoRemover, value: f32) -> Block {
        let render_buffer = RenderBuffer::for_config(remover.config(), 1, 1);
        let mut capture = Block::new_with_value(1, 1, value);
        remover.process_capture(
            EchoPathVariability::default(),
            false,
            None,
            &render_buffer,
            None,
            &mut capture,
        );
        capture
    }

    fn assert_ramp(output: &[f32], from: f32, to: f32) {
        for k in 0..TRANSITION_SIZE {
            let a = (k + 1) as f32 / (TRANSITION_SIZE + 1) as f32;
            let expected = a * to + (1.0 - a) * from;
            assert!((output[k] - expected).abs() < 1e-3, "sample {k}: {} != {expected}", output[k]);
        }
        assert!(output[TRANSITION_SIZE..].iter().all(|&v| v == to));
    }

    #[test]
    fn processing_path_changes_are_crossfaded() {
        let config = EchoRemoverConfig::default();
        fn linear_from_third_block(updates: usize, state: &mut StaticEchoState) {
            state.use_linear_filter_output = updates >= 3;
        }
        let mut state = StaticEchoState::new(1);
        state.on_update = Some(linear_from_third_block);
        let mut remover = EchoRemover::with_components(
            &config,
            16000,
            1,
            1,
            0,
            components(constant_main_canceller(10.0), state, Box::new(UnitGain)),
        )
        .unwrap();
        remover.set_capture_output_usage(false);

        // Linear is selected initially, so the first block fades to the capture.
        let output = process_constant_capture(&mut remover, 100.0);
        assert_ramp(output.view(0, 0), 10.0, 100.0);
        assert_eq!(remover.path_selector.selected(), ProcessingPath::Original);

        let output = process_constant_capture(&mut remover, 100.0);
        assert!(output.view(0, 0).iter().all(|&v| v == 100.0));

        let output = process_constant_capture(&mut remover, 100.0);
        assert_ramp(output.view(0, 0), 100.0, 10.0);
        assert_eq!(remover.path_selector.selected(), ProcessingPath::Linear);

        let output = process_constant_capture(&mut remover, 100.0);
        assert!(output.view(0, 0).iter().all(|&v| v == 10.0));
    }

    #[test]
    fn delay_changes_restore_initial_suppression() {
        let config = EchoRemoverConfig::default();
        let gain = RecordingGain::default();
        let calls = Rc::clone(&gain.initial_state_calls);
        let mut remover = EchoRemover::with_components(
            &config,
            16000,
            1,
            1,
            0,
            components(recording_canceller(1), StaticEchoState::new(1), Box::new(gain)),
        )
        .unwrap();
        let render_buffer = RenderBuffer::for_config(&config, 1, 1);
        let mut capture = Block::new(1, 1);

        for variability in [
            EchoPathVariability::new(true, DelayAdjustment::None),
            EchoPathVariability::default(),
            EchoPathVariability::new(false, DelayAdjustment::NewDetectedDelay),
            EchoPathVariability::new(false, DelayAdjustment::BufferFlush),
        ] {
            remover.process_capture(variability, false, None, &render_buffer, None, &mut capture);
        }
        assert_eq!(*calls.borrow(), vec![true, true]);
    }

    #[test]
    fn transition_leaves_initial_state_everywhere() {
        let config = EchoRemoverConfig::default();
        let canceller = recording_canceller(1);
        let exits = Rc::clone(&canceller.initial_state_exits);
        let gain = RecordingGain::default();
        let calls = Rc::clone(&gain.initial_state_calls);
        fn trigger_after_second_block(updates: usize, state: &mut StaticEchoState) {
            state.transition_triggered = updates == 2;
        }
        let mut state = StaticEchoState::new(1);
        state.on_update = Some(trigger_after_second_block);
        let mut remover = EchoRemover::with_components(
            &config,
            16000,
            1,
            1,
            0,
            components(canceller, state, Box::new(gain)),
        )
        .unwrap();
        let render_buffer = RenderBuffer::for_config(&config, 1, 1);
        let mut capture = Block::new(1, 1);

        for k in 1..=5 {
            remover.process_capture(
                EchoPathVariability::default(),
                false,
                None,
                &render_buffer,
                None,
                &mut capture,
            );
            // The flag raised by the second update is acted on in the third block.
            let expected_exits = usize::from(k >= 3);
            assert_eq!(exits.get(), expected_exits, "block {k}");
        }
        assert_eq!(*calls.borrow(), vec![false]);
    }

    fn gain_inputs_for(usable_linear_estimate: bool) -> (EchoRemover, GainInputs) {
        let config = EchoRemoverConfig::default();
        let gain = RecordingGain::default();
        let inputs = Rc::clone(&gain.inputs);
        let mut state = StaticEchoState::new(1);
        state.usable_linear_estimate = usable_linear_estimate;
        let mut remover = EchoRemover::with_components(
            &config,
            16000,
            1,
            1,
            0,
            components(constant_main_canceller(10.0), state, Box::new(gain)),
        )
        .unwrap();
        process_constant_capture(&mut remover, 100.0);
        let recorded = inputs.borrow().last().cloned().unwrap();
        (remover, recorded)
    }

    #[test]
    fn usable_linear_estimate_feeds_linear_spectra_to_gain() {
        let (remover, inputs) = gain_inputs_for(true);
        assert_eq!(inputs.echo, remover.s2_linear[0]);
        for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
            assert_eq!(inputs.nearend[k], remover.e2[0][k].min(remover.y2[0][k]));
        }
        // The linear output is a tenth of the capture, so it bounds the near end.
        assert_eq!(inputs.nearend, remover.e2[0]);
        assert!(inputs.echo.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn unusable_linear_estimate_feeds_residual_and_capture_to_gain() {
        let (remover, inputs) = gain_inputs_for(false);
        assert_eq!(inputs.echo, remover.r2[0]);
        assert_eq!(inputs.nearend, remover.y2[0]);
        assert!(inputs.nearend.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn debug_output_skips_collaborators() {
        let config = EchoRemoverConfig::default();
        let remover = EchoRemover::new(&config, 16000, 1, 1, 3).unwrap();
        let debug = format!("{remover:?}");
        assert!(debug.contains("instance_id: 3"));
        assert!(!debug.contains("canceller"));
    }

    #[test]
    fn echo_return_loss_decreases_with_erl() {
        let mut state = StaticEchoState::new(1);
        let mut last = f64::NEG_INFINITY;
        for erl in [10.0f32, 1.0, 0.5, 0.1, 0.01, 1e-4] {
            state.erl_time_domain = erl;
            let metrics = EchoMetrics::from_state(&state);
            assert!(metrics.echo_return_loss > last);
            last = metrics.echo_return_loss;
        }
    }

    #[proptest]
    fn echo_return_loss_is_strictly_monotonic(
        #[strategy(1e-6f32..1e3)] erl: f32,
        #[strategy(0.01f32..0.99)] factor: f32,
    ) {
        let mut state = StaticEchoState::new(1);
        state.erl_time_domain = erl;
        let before = EchoMetrics::from_state(&state).echo_return_loss;
        state.erl_time_domain = erl * factor;
        let after = EchoMetrics::from_state(&state).echo_return_loss;
        prop_assert!(after > before);
    }

    #[test]
    fn erle_metric_uses_log2_to_db() {
        let mut state = StaticEchoState::new(1);
        state.fullband_erle_log2 = 2.0;
        let metrics = EchoMetrics::from_state(&state);
        assert!((metrics.echo_return_loss_enhancement - 6.0206).abs() < 1e-3);
    }

    #[test]
    #[should_panic(expected = "capture channel count mismatch")]
    fn mismatched_capture_channels_panic() {
        let config = EchoRemoverConfig::default();
        let mut remover = EchoRemover::new(&config, 16000, 1, 2, 0).unwrap();
        let render_buffer = RenderBuffer::for_config(&config, 1, 1);
        let mut capture = Block::new(1, 1);
        remover.process_capture(
            EchoPathVariability::default(),
            false,
            None,
            &render_buffer,
            None,
            &mut capture,
        );
    }

    #[test]
    #[should_panic(expected = "capture band count mismatch")]
    fn mismatched_capture_bands_panic() {
        let config = EchoRemoverConfig::default();
        let mut remover = EchoRemover::new(&config, 32000, 1, 1, 0).unwrap();
        let render_buffer = RenderBuffer::for_config(&config, 2, 1);
        let mut capture = Block::new(1, 1);
        remover.process_capture(
            EchoPathVariability::default(),
            false,
            None,
            &render_buffer,
            None,
            &mut capture,
        );
    }

    #[test]
    #[should_panic(expected = "render channel count mismatch")]
    fn mismatched_render_channels_panic() {
        let config = EchoRemoverConfig::default();
        let mut remover = EchoRemover::new(&config, 16000, 2, 1, 0).unwrap();
        let render_buffer = RenderBuffer::for_config(&config, 1, 1);
        let mut capture = Block::new(1, 1);
        remover.process_capture(
            EchoPathVariability::default(),
            false,
            None,
            &render_buffer,
            None,
            &mut capture,
        );
    }

    #[test]
    #[should_panic(expected = "linear output channel count mismatch")]
    fn mismatched_linear_output_panics() {
        let config = EchoRemoverConfig::default();
        let mut remover = EchoRemover::new(&config, 16000, 1, 1, 0).unwrap();
        let render_buffer = RenderBuffer::for_config(&config, 1, 1);
        let mut capture = Block::new(1, 1);
        let mut linear = Block::new(1, 2);
        remover.process_capture(
            EchoPathVariability::default(),
            false,
            None,
            &render_buffer,
            Some(&mut linear),
            &mut capture,
        );
    }

    #[test]
    #[should_panic(expected = "render buffer too small")]
    fn undersized_render_buffer_panics() {
        let config = EchoRemoverConfig::default();
        let mut remover = EchoRemover::new(&config, 16000, 1, 1, 0).unwrap();
        let render_buffer = RenderBuffer::new(1, 1, 2);
        let mut capture = Block::new(1, 1);
        remover.process_capture(
            EchoPathVariability::default(),
            false,
            None,
            &render_buffer,
            None,
            &mut capture,
        );
    }

    fn power(x: &[f32]) -> f32 {
        x.iter().map(|v| v * v).sum()
    }

    #[test]
    fn tone_echo_is_removed() {
        const DELAY_BLOCKS: usize = 2;
        const NUM_BLOCKS: usize = 500;
        const MEASURED_BLOCKS: usize = 50;
        const AMPLITUDE: f32 = 10000.0;

        let config = EchoRemoverConfig::default();
        let mut remover = EchoRemover::new(&config, 16000, 1, 1, 0).unwrap();
        let mut render_buffer = RenderBuffer::for_config(&config, 1, 1);
        let delay = DelayEstimate::new(DelayEstimateQuality::Refined, 0);

        let mut history: VecDeque<Block> = (0..DELAY_BLOCKS).map(|_| Block::new(1, 1)).collect();
        let mut echo_power = 0.0f32;
        let mut output_power = 0.0f32;

        for k in 0..NUM_BLOCKS {
            let mut render = Block::new(1, 1);
            for (j, v) in render.view_mut(0, 0).iter_mut().enumerate() {
                let n = (k * BLOCK_SIZE + j) as f32;
                *v = AMPLITUDE * (2.0 * PI * 1000.0 * n / 16000.0).sin();
            }
            render_buffer.insert(&render);
            history.push_back(render);
            let delayed = history.pop_front().unwrap_or_else(|| Block::new(1, 1));

            let mut capture = Block::new(1, 1);
            for (y, x) in capture.view_mut(0, 0).iter_mut().zip(delayed.view(0, 0)) {
                *y = 0.5 * x;
            }
            let captured_power = power(capture.view(0, 0));

            remover.process_capture(
                EchoPathVariability::default(),
                false,
                Some(&delay),
                &render_buffer,
                None,
                &mut capture,
            );

            if k >= NUM_BLOCKS - MEASURED_BLOCKS {
                echo_power += captured_power;
                output_power += power(capture.view(0, 0));
            }
        }

        let attenuation_db = 10.0 * (echo_power / output_power.max(1e-10)).log10();
        assert!(attenuation_db >= 20.0, "attenuation {attenuation_db} dB");
        assert!(remover.metrics().echo_return_loss_enhancement > 0.0);
    }
}

//! Linear echo cancellation with a main and a shadow adaptive filter per
//! capture channel.
//!
//! The main filter is the accurate NLMS estimate used for the output. The
//! shadow filter adapts with a fixed, fast rate; it catches echo path changes
//! sooner and is restarted from the main filter when it keeps doing worse.

use crate::adaptive_fir_filter::{AdaptiveFirFilter, compute_erl};
use crate::block::Block;
use crate::block_fft::BlockFft;
use crate::common::{BLOCK_SIZE, FFT_LENGTH, FFT_LENGTH_BY_2, FFT_LENGTH_BY_2_PLUS_1, get_time_domain_length};
use crate::config::EchoRemoverConfig;
use crate::echo_path_variability::{DelayAdjustment, EchoPathVariability};
use crate::fft_data::FftData;
use crate::main_filter_update_gain::MainFilterUpdateGain;
use crate::render_buffer::RenderBuffer;
use crate::shadow_filter_update_gain::ShadowFilterUpdateGain;
use crate::subtractor_output::SubtractorOutput;

/// Blocks the shadow filter may do worse than the main filter before it is
/// restarted from the main filter.
const POOR_SHADOW_FILTER_BLOCKS: usize = 5;

/// `e = y - s`, where `s` is the second half of the inverse transform of `S`.
fn prediction_error(
    fft: &mut BlockFft,
    s_fft: &FftData,
    y: &[f32],
    e: &mut [f32; BLOCK_SIZE],
    s: &mut [f32; BLOCK_SIZE],
) {
    let mut tmp = [0.0f32; FFT_LENGTH];
    fft.ifft(s_fft, &mut tmp);
    const SCALE: f32 = 1.0 / FFT_LENGTH_BY_2 as f32;
    for k in 0..BLOCK_SIZE {
        s[k] = SCALE * tmp[k + FFT_LENGTH_BY_2];
        e[k] = y[k] - s[k];
    }
}

fn scale_filter_output(y: &[f32], factor: f32, e: &mut [f32], s: &mut [f32]) {
    debug_assert_eq!(y.len(), e.len());
    debug_assert_eq!(y.len(), s.len());
    for ((e_k, s_k), &y_k) in e.iter_mut().zip(s.iter_mut()).zip(y) {
        *s_k *= factor;
        *e_k = y_k - *s_k;
    }
}

/// Tracks the ratio of error energy to capture energy over groups of blocks.
/// A ratio well above one means the main filter adds echo instead of
/// removing it and should be scaled down.
#[derive(Debug)]
struct FilterMisadjustmentEstimator {
    n_blocks: i32,
    n_blocks_acum: i32,
    e2_acum: f32,
    y2_acum: f32,
    inv_misadjustment: f32,
    overhang: i32,
}

impl FilterMisadjustmentEstimator {
    fn new() -> Self {
        Self {
            n_blocks: 4,
            n_blocks_acum: 0,
            e2_acum: 0.0,
            y2_acum: 0.0,
            inv_misadjustment: 0.0,
            overhang: 0,
        }
    }

    fn update(&mut self, output: &SubtractorOutput) {
        self.e2_acum += output.e2_main_sum;
        self.y2_acum += output.y2;
        self.n_blocks_acum += 1;
        if self.n_blocks_acum < self.n_blocks {
            return;
        }

        let n_blocks = self.n_blocks as f32;
        if self.y2_acum > n_blocks * 200.0 * 200.0 * BLOCK_SIZE as f32 {
            let update = self.e2_acum / self.y2_acum;
            if self.e2_acum > n_blocks * 7500.0 * 7500.0 * BLOCK_SIZE as f32 {
                self.overhang = 4;
            } else {
                self.overhang = (self.overhang - 1).max(0);
            }
            if update < self.inv_misadjustment || self.overhang > 0 {
                self.inv_misadjustment += 0.1 * (update - self.inv_misadjustment);
            }
        }
        self.e2_acum = 0.0;
        self.y2_acum = 0.0;
        self.n_blocks_acum = 0;
    }

    /// Factor that corrects half of the estimated mismatch.
    fn misadjustment(&self) -> f32 {
        debug_assert!(self.inv_misadjustment > 0.0);
        2.0 / self.inv_misadjustment.sqrt()
    }

    fn is_adjustment_needed(&self) -> bool {
        self.inv_misadjustment > 10.0
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

#[derive(Debug)]
pub struct Subtractor {
    fft: BlockFft,
    config: EchoRemoverConfig,
    num_capture_channels: usize,
    main_filters: Vec<AdaptiveFirFilter>,
    shadow_filters: Vec<AdaptiveFirFilter>,
    main_gains: Vec<MainFilterUpdateGain>,
    shadow_gains: Vec<ShadowFilterUpdateGain>,
    filter_misadjustment_estimators: Vec<FilterMisadjustmentEstimator>,
    poor_shadow_filter_counters: Vec<usize>,
    shadow_filter_reset_hangover: Vec<i32>,
    main_frequency_responses: Vec<Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>>,
    main_impulse_responses: Vec<Vec<f32>>,
}

impl Subtractor {
    pub fn new(
        config: &EchoRemoverConfig,
        num_render_channels: usize,
        num_capture_channels: usize,
    ) -> Self {
        let filter = &config.filter;
        let max_main_len = filter.main.length_blocks.max(filter.main_initial.length_blocks);
        let max_shadow_len = filter.shadow.length_blocks.max(filter.shadow_initial.length_blocks);
        let duration = filter.config_change_duration_blocks;

        let main_filters = (0..num_capture_channels)
            .map(|_| {
                AdaptiveFirFilter::new(
                    max_main_len,
                    filter.main_initial.length_blocks,
                    duration,
                    num_render_channels,
                )
            })
            .collect();
        let shadow_filters = (0..num_capture_channels)
            .map(|_| {
                AdaptiveFirFilter::new(
                    max_shadow_len,
                    filter.shadow_initial.length_blocks,
                    duration,
                    num_render_channels,
                )
            })
            .collect();

        Self {
            fft: BlockFft::new(),
            config: config.clone(),
            num_capture_channels,
            main_filters,
            shadow_filters,
            main_gains: (0..num_capture_channels)
                .map(|_| MainFilterUpdateGain::new(&filter.main_initial, duration))
                .collect(),
            shadow_gains: (0..num_capture_channels)
                .map(|_| ShadowFilterUpdateGain::new(&filter.shadow_initial, duration))
                .collect(),
            filter_misadjustment_estimators: (0..num_capture_channels)
                .map(|_| FilterMisadjustmentEstimator::new())
                .collect(),
            poor_shadow_filter_counters: vec![0; num_capture_channels],
            shadow_filter_reset_hangover: vec![0; num_capture_channels],
            main_frequency_responses: (0..num_capture_channels)
                .map(|_| {
                    let mut h2 = Vec::with_capacity(max_main_len);
                    h2.resize(filter.main_initial.length_blocks, [0.0; FFT_LENGTH_BY_2_PLUS_1]);
                    h2
                })
                .collect(),
            main_impulse_responses: vec![
                vec![0.0; get_time_domain_length(max_main_len)];
                num_capture_channels
            ],
        }
    }

    /// Runs both filters on one capture block and adapts them.
    pub fn process(
        &mut self,
        render_buffer: &RenderBuffer,
        capture: &Block,
        saturated_capture: bool,
        outputs: &mut [SubtractorOutput],
    ) {
        assert_eq!(
            self.num_capture_channels,
            capture.num_channels(),
            "subtractor capture channel count mismatch"
        );
        assert_eq!(
            self.num_capture_channels,
            outputs.len(),
            "subtractor output channel count mismatch"
        );

        // Filter sizes are shared by all channels.
        let main_size = self.main_filters[0].size_partitions();
        let shadow_size = self.shadow_filters[0].size_partitions();
        let mut x2_main = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
        let mut x2_shadow = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
        if main_size == shadow_size {
            render_buffer.spectral_sum(main_size, &mut x2_main);
            x2_shadow.copy_from_slice(&x2_main);
        } else if main_size > shadow_size {
            render_buffer.spectral_sums(shadow_size, main_size, &mut x2_shadow, &mut x2_main);
        } else {
            render_buffer.spectral_sums(main_size, shadow_size, &mut x2_main, &mut x2_shadow);
        }

        let mut s = FftData::default();
        let mut e_shadow_fft = FftData::default();
        let mut g = FftData::default();
        let mut erl = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];

        for (ch, output) in outputs.iter_mut().enumerate() {
            let y = capture.view(0, ch);

            self.main_filters[ch].filter(render_buffer, &mut s);
            prediction_error(&mut self.fft, &s, y, &mut output.e_main, &mut output.s_main);

            self.shadow_filters[ch].filter(render_buffer, &mut s);
            prediction_error(&mut self.fft, &s, y, &mut output.e_shadow, &mut output.s_shadow);

            output.compute_metrics(y);

            let mut main_filter_adjusted = false;
            let estimator = &mut self.filter_misadjustment_estimators[ch];
            estimator.update(output);
            if estimator.is_adjustment_needed() {
                let scale = estimator.misadjustment();
                self.main_filters[ch].scale_filter(scale);
                for h_k in &mut self.main_impulse_responses[ch] {
                    *h_k *= scale;
                }
                scale_filter_output(y, scale, &mut output.e_main, &mut output.s_main);
                estimator.reset();
                main_filter_adjusted = true;
            }

            self.fft.zero_padded_fft(&output.e_main, &mut output.e_main_fft);
            self.fft.zero_padded_fft(&output.e_shadow, &mut e_shadow_fft);
            output.e_main_fft.spectrum(&mut output.e2_main);
            e_shadow_fft.spectrum(&mut output.e2_shadow);

            if main_filter_adjusted {
                g.clear();
            } else {
                let disallow_leakage_diverged = self.shadow_filter_reset_hangover[ch] > 0;
                compute_erl(&self.main_frequency_responses[ch], &mut erl);
                self.main_gains[ch].compute(
                    &x2_main,
                    output,
                    &erl,
                    self.main_filters[ch].size_partitions(),
                    saturated_capture,
                    disallow_leakage_diverged,
                    &mut g,
                );
            }
            self.main_filters[ch].adapt_with_impulse_response(
                render_buffer,
                &g,
                &mut self.main_impulse_responses[ch],
            );
            self.main_filters[ch].compute_frequency_response(&mut self.main_frequency_responses[ch]);

            self.poor_shadow_filter_counters[ch] = if output.e2_main_sum < output.e2_shadow_sum {
                self.poor_shadow_filter_counters[ch] + 1
            } else {
                0
            };
            let shadow_size = self.shadow_filters[ch].size_partitions();
            if self.poor_shadow_filter_counters[ch] < POOR_SHADOW_FILTER_BLOCKS {
                self.shadow_gains[ch].compute(
                    &x2_shadow,
                    &e_shadow_fft,
                    shadow_size,
                    saturated_capture,
                    &mut g,
                );
                self.shadow_filter_reset_hangover[ch] =
                    (self.shadow_filter_reset_hangover[ch] - 1).max(0);
            } else {
                self.poor_shadow_filter_counters[ch] = 0;
                self.shadow_filters[ch].set_filter(
                    self.main_filters[ch].size_partitions(),
                    self.main_filters[ch].get_filter(),
                );
                self.shadow_gains[ch].compute(
                    &x2_shadow,
                    &output.e_main_fft,
                    shadow_size,
                    saturated_capture,
                    &mut g,
                );
                self.shadow_filter_reset_hangover[ch] =
                    self.config.filter.shadow_reset_hangover_blocks;
            }
            self.shadow_filters[ch].adapt(render_buffer, &g);

            for v in &mut output.e_main {
                *v = v.clamp(-32768.0, 32767.0);
            }
        }
    }

    /// A delay change restarts both filters in their initial configuration.
    /// A gain change only resets the main filter's error estimate.
    pub fn handle_echo_path_change(&mut self, echo_path_variability: &EchoPathVariability) {
        let filter = &self.config.filter;
        if echo_path_variability.delay_change != DelayAdjustment::None {
            for ch in 0..self.num_capture_channels {
                self.main_filters[ch].handle_echo_path_change();
                self.shadow_filters[ch].handle_echo_path_change();
                self.main_gains[ch].handle_echo_path_change(echo_path_variability);
                self.shadow_gains[ch].handle_echo_path_change();
                self.main_gains[ch].set_config(&filter.main_initial, true);
                self.shadow_gains[ch].set_config(&filter.shadow_initial, true);
                self.main_filters[ch].set_size_partitions(filter.main_initial.length_blocks, true);
                self.shadow_filters[ch]
                    .set_size_partitions(filter.shadow_initial.length_blocks, true);
                self.filter_misadjustment_estimators[ch].reset();
                self.poor_shadow_filter_counters[ch] = 0;
                self.shadow_filter_reset_hangover[ch] = 0;
            }
        }

        if echo_path_variability.gain_change {
            for gain in &mut self.main_gains {
                gain.handle_echo_path_change(echo_path_variability);
            }
        }
    }

    /// Moves to the steady-state filter configuration, blended in over the
    /// configured change duration.
    pub fn exit_initial_state(&mut self) {
        let filter = &self.config.filter;
        for ch in 0..self.num_capture_channels {
            self.main_gains[ch].set_config(&filter.main, false);
            self.shadow_gains[ch].set_config(&filter.shadow, false);
            self.main_filters[ch].set_size_partitions(filter.main.length_blocks, false);
            self.shadow_filters[ch].set_size_partitions(filter.shadow.length_blocks, false);
        }
    }

    /// Per-partition frequency responses of the main filters, per capture
    /// channel.
    pub fn filter_frequency_responses(&self) -> &[Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>] {
        &self.main_frequency_responses
    }

    /// Impulse responses of the main filters, per capture channel.
    pub fn filter_impulse_responses(&self) -> &[Vec<f32>] {
        &self.main_impulse_responses
    }
}

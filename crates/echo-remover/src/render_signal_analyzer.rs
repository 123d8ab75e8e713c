//! Narrowband analysis of the render signal.

use crate::common::{FFT_LENGTH_BY_2, FFT_LENGTH_BY_2_MINUS_1, FFT_LENGTH_BY_2_PLUS_1};
use crate::config::EchoRemoverConfig;
use crate::render_buffer::RenderBuffer;

/// Blocks a bin must stay narrow before the signal counts as poorly exciting.
const POOR_EXCITATION_BLOCKS: usize = 10;

/// Counts, per bin, the consecutive blocks in which the render spectrum at
/// the echo delay showed a local narrow peak.
fn identify_small_narrow_band_regions(
    render_buffer: &RenderBuffer,
    delay_partitions: Option<usize>,
    narrow_band_counters: &mut [usize; FFT_LENGTH_BY_2_MINUS_1],
) {
    let Some(delay) = delay_partitions else {
        narrow_band_counters.fill(0);
        return;
    };

    let mut channel_counters = [0usize; FFT_LENGTH_BY_2_MINUS_1];
    for x2 in render_buffer.spectrum(delay) {
        for k in 1..FFT_LENGTH_BY_2 {
            if x2[k] > 3.0 * x2[k - 1].max(x2[k + 1]) {
                channel_counters[k - 1] += 1;
            }
        }
    }
    for (counter, &channel_count) in narrow_band_counters.iter_mut().zip(&channel_counters) {
        *counter = if channel_count > 0 { *counter + 1 } else { 0 };
    }
}

/// Looks for a single dominant spectral peak in the newest render block and
/// keeps a found peak for `strong_peak_freeze_duration` blocks.
fn identify_strong_narrow_band_component(
    render_buffer: &RenderBuffer,
    strong_peak_freeze_duration: usize,
    narrow_peak_band: &mut Option<usize>,
    narrow_peak_counter: &mut usize,
) {
    if narrow_peak_band.is_some() {
        *narrow_peak_counter += 1;
        if *narrow_peak_counter > strong_peak_freeze_duration {
            *narrow_peak_band = None;
        }
    }

    let x_latest = render_buffer.block(0);
    let mut max_peak_level = 0.0f32;

    for (channel, x2_latest) in render_buffer.spectrum(0).iter().enumerate() {
        let peak_bin = x2_latest
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map_or(0, |(i, _)| i);

        let low = peak_bin.saturating_sub(14)..peak_bin.saturating_sub(4);
        let high = (peak_bin + 5).min(FFT_LENGTH_BY_2_PLUS_1)..(peak_bin + 15).min(FFT_LENGTH_BY_2_PLUS_1);
        let non_peak_power = low
            .chain(high)
            .fold(0.0f32, |max, k| max.max(x2_latest[k]));

        let max_abs = (0..x_latest.num_bands().min(2))
            .flat_map(|band| x_latest.view(band, channel).iter())
            .fold(0.0f32, |max, &x| max.max(x.abs()));

        let peak_level = x2_latest[peak_bin];
        if peak_bin > 0
            && max_abs > 100.0
            && peak_level > 100.0 * non_peak_power
            && peak_level > max_peak_level
        {
            max_peak_level = peak_level;
            *narrow_peak_band = Some(peak_bin);
            *narrow_peak_counter = 0;
        }
    }
}

/// Default render analyzer.
#[derive(Debug)]
pub struct RenderSignalAnalyzer {
    strong_peak_freeze_duration: usize,
    narrow_band_counters: [usize; FFT_LENGTH_BY_2_MINUS_1],
    narrow_peak_band: Option<usize>,
    narrow_peak_counter: usize,
}

impl RenderSignalAnalyzer {
    pub fn new(config: &EchoRemoverConfig) -> Self {
        Self {
            strong_peak_freeze_duration: config.filter.main.length_blocks,
            narrow_band_counters: [0; FFT_LENGTH_BY_2_MINUS_1],
            narrow_peak_band: None,
            narrow_peak_counter: 0,
        }
    }

    /// Analyzes the newest render block and the spectrum at the echo delay.
    pub fn update(&mut self, render_buffer: &RenderBuffer, delay_partitions: Option<usize>) {
        identify_small_narrow_band_regions(
            render_buffer,
            delay_partitions,
            &mut self.narrow_band_counters,
        );
        identify_strong_narrow_band_component(
            render_buffer,
            self.strong_peak_freeze_duration,
            &mut self.narrow_peak_band,
            &mut self.narrow_peak_counter,
        );
    }

    /// True when some bin has been narrow for a sustained period.
    pub fn poor_signal_excitation(&self) -> bool {
        self.narrow_band_counters
            .iter()
            .any(|&count| count > POOR_EXCITATION_BLOCKS)
    }

    pub fn narrow_peak_band(&self) -> Option<usize> {
        self.narrow_peak_band
    }
}

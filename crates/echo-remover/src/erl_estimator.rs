//! Echo return loss estimation with maximum statistics.
//!
//! The ERL follows new lower values quickly and holds them. When no lower
//! value has been seen for a while the estimate is allowed to rise, by 3 dB
//! per block, up to a fixed maximum.

use crate::common::{FFT_LENGTH_BY_2, FFT_LENGTH_BY_2_MINUS_1, FFT_LENGTH_BY_2_PLUS_1};

const MIN_ERL: f32 = 0.01;
const MAX_ERL: f32 = 1000.0;
const BLOCKS_TO_HOLD_ERL: i32 = 1000;
const ERL_SMOOTHING: f32 = 0.1;
/// Render power of white noise at -46 dBFS, per bin.
const X2_MIN: f32 = 44_015_068.0;

#[derive(Debug)]
pub(crate) struct ErlEstimator {
    startup_phase_length_blocks: usize,
    erl: [f32; FFT_LENGTH_BY_2_PLUS_1],
    hold_counters: [i32; FFT_LENGTH_BY_2_MINUS_1],
    erl_time_domain: f32,
    hold_counter_time_domain: i32,
    blocks_since_reset: usize,
}

impl ErlEstimator {
    pub(crate) fn new(startup_phase_length_blocks: usize) -> Self {
        Self {
            startup_phase_length_blocks,
            erl: [MAX_ERL; FFT_LENGTH_BY_2_PLUS_1],
            hold_counters: [0; FFT_LENGTH_BY_2_MINUS_1],
            erl_time_domain: MAX_ERL,
            hold_counter_time_domain: 0,
            blocks_since_reset: 0,
        }
    }

    /// Restarts the startup phase. The current estimates are kept.
    pub(crate) fn reset(&mut self) {
        self.blocks_since_reset = 0;
    }

    /// Updates the estimates from the render spectra aligned with the capture
    /// and the capture spectra of the channels whose filters have converged.
    pub(crate) fn update(
        &mut self,
        converged_filters: &[bool],
        render_spectra: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        capture_spectra: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
    ) {
        debug_assert_eq!(capture_spectra.len(), converged_filters.len());

        self.blocks_since_reset += 1;
        if self.blocks_since_reset < self.startup_phase_length_blocks
            || !converged_filters.iter().any(|&c| c)
        {
            return;
        }

        let y2 = channel_max(
            capture_spectra
                .iter()
                .zip(converged_filters)
                .filter_map(|(spectrum, &converged)| converged.then_some(spectrum)),
        );
        let x2 = channel_max(render_spectra.iter());

        for k in 1..FFT_LENGTH_BY_2 {
            if x2[k] > X2_MIN {
                let new_erl = y2[k] / x2[k];
                if new_erl < self.erl[k] {
                    self.hold_counters[k - 1] = BLOCKS_TO_HOLD_ERL;
                    self.erl[k] += ERL_SMOOTHING * (new_erl - self.erl[k]);
                    self.erl[k] = self.erl[k].max(MIN_ERL);
                }
            }
        }

        for (k, counter) in (1..FFT_LENGTH_BY_2).zip(self.hold_counters.iter_mut()) {
            *counter -= 1;
            if *counter <= 0 {
                self.erl[k] = MAX_ERL.min(2.0 * self.erl[k]);
            }
        }

        self.erl[0] = self.erl[1];
        self.erl[FFT_LENGTH_BY_2] = self.erl[FFT_LENGTH_BY_2 - 1];

        let x2_sum: f32 = x2.iter().sum();
        if x2_sum > X2_MIN * FFT_LENGTH_BY_2_PLUS_1 as f32 {
            let y2_sum: f32 = y2.iter().sum();
            let new_erl = y2_sum / x2_sum;
            if new_erl < self.erl_time_domain {
                self.hold_counter_time_domain = BLOCKS_TO_HOLD_ERL;
                self.erl_time_domain += ERL_SMOOTHING * (new_erl - self.erl_time_domain);
                self.erl_time_domain = self.erl_time_domain.max(MIN_ERL);
            }
        }

        self.hold_counter_time_domain -= 1;
        if self.hold_counter_time_domain <= 0 {
            self.erl_time_domain = MAX_ERL.min(2.0 * self.erl_time_domain);
        }
    }

    pub(crate) fn erl(&self) -> &[f32; FFT_LENGTH_BY_2_PLUS_1] {
        &self.erl
    }

    pub(crate) fn erl_time_domain(&self) -> f32 {
        self.erl_time_domain
    }
}

fn channel_max<'a>(
    spectra: impl Iterator<Item = &'a [f32; FFT_LENGTH_BY_2_PLUS_1]>,
) -> [f32; FFT_LENGTH_BY_2_PLUS_1] {
    let mut max = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
    for spectrum in spectra {
        for (m, &v) in max.iter_mut().zip(spectrum.iter()) {
            *m = m.max(v);
        }
    }
    max
}

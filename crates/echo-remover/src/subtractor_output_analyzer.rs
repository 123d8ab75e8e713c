//! Convergence and divergence classification of the linear filters.

use crate::channels::ChannelBuffer;
use crate::common::BLOCK_SIZE;
use crate::subtractor_output::SubtractorOutput;

const CONVERGENCE_THRESHOLD: f32 = 50.0 * 50.0 * BLOCK_SIZE as f32;
const CONVERGENCE_THRESHOLD_LOW_LEVEL: f32 = 20.0 * 20.0 * BLOCK_SIZE as f32;
const DIVERGENCE_THRESHOLD: f32 = 30.0 * 30.0 * BLOCK_SIZE as f32;

/// Summary of one block's filter classification over all capture channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FilterConvergence {
    pub any_filter_converged: bool,
    pub any_shadow_filter_converged: bool,
    pub all_filters_diverged: bool,
}

#[derive(Debug)]
pub(crate) struct SubtractorOutputAnalyzer {
    filters_converged: ChannelBuffer<bool>,
}

impl SubtractorOutputAnalyzer {
    pub(crate) fn new(num_capture_channels: usize) -> Self {
        Self {
            filters_converged: ChannelBuffer::new(num_capture_channels),
        }
    }

    pub(crate) fn update(&mut self, subtractor_output: &[SubtractorOutput]) -> FilterConvergence {
        debug_assert_eq!(subtractor_output.len(), self.filters_converged.len());

        let mut result = FilterConvergence {
            all_filters_diverged: true,
            ..Default::default()
        };
        for (converged, output) in self.filters_converged.iter_mut().zip(subtractor_output) {
            let y2 = output.y2;
            let e2_main = output.e2_main_sum;
            let e2_shadow = output.e2_shadow_sum;

            let main_converged = e2_main < 0.5 * y2 && y2 > CONVERGENCE_THRESHOLD;
            let shadow_converged_strict = e2_shadow < 0.05 * y2 && y2 > CONVERGENCE_THRESHOLD;
            let shadow_converged_relaxed =
                e2_shadow < 0.3 * y2 && y2 > CONVERGENCE_THRESHOLD_LOW_LEVEL;
            let diverged = e2_main.min(e2_shadow) > 1.5 * y2 && y2 > DIVERGENCE_THRESHOLD;

            *converged = main_converged || shadow_converged_strict;
            result.any_filter_converged |= *converged;
            result.any_shadow_filter_converged |= shadow_converged_relaxed;
            result.all_filters_diverged &= diverged;
        }
        result
    }

    pub(crate) fn converged_filters(&self) -> &[bool] {
        &self.filters_converged
    }

    pub(crate) fn handle_echo_path_change(&mut self) {
        self.filters_converged.fill(false);
    }
}

//! Echo remover quality metrics: tracks and periodically reports ERL, ERLE,
//! capture saturation and linear filter usage.

use crate::collaborators::EchoState;
use crate::common::{METRICS_COLLECTION_BLOCKS, METRICS_REPORTING_INTERVAL_BLOCKS, log2_to_db};

/// Metric tracking the sum, floor and ceiling of a value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct DbMetric {
    pub sum_value: f32,
    pub floor_value: f32,
    pub ceil_value: f32,
}

impl DbMetric {
    pub(crate) fn new(sum_value: f32, floor_value: f32, ceil_value: f32) -> Self {
        Self {
            sum_value,
            floor_value,
            ceil_value,
        }
    }

    /// Accumulates `value`.
    pub(crate) fn update(&mut self, value: f32) {
        self.sum_value += value;
        self.floor_value = self.floor_value.min(value);
        self.ceil_value = self.ceil_value.max(value);
    }
}

/// Transforms a linear-domain value into clamped integer dB.
pub(crate) fn transform_db_metric_for_reporting(
    negate: bool,
    min_value: f32,
    max_value: f32,
    offset: f32,
    scaling: f32,
    value: f32,
) -> i32 {
    let mut new_value = 10.0 * (value * scaling + 1e-10).log10() + offset;
    if negate {
        new_value = -new_value;
    }
    new_value.clamp(min_value, max_value) as i32
}

/// Values gathered over the computation blocks before a report is emitted.
#[derive(Debug, Default, Clone, Copy)]
struct PendingReport {
    usable_linear_estimate: bool,
    filter_delay_blocks: usize,
    erl_average: i32,
    erl_min: i32,
    erl_max: i32,
}

/// Handles the reporting of metrics for the echo remover.
///
/// Values are collected for [`METRICS_COLLECTION_BLOCKS`] blocks. The
/// remaining blocks of each reporting interval convert them to dB and emit
/// one `tracing` event.
#[derive(Debug)]
pub(crate) struct EchoRemoverMetrics {
    instance_id: usize,
    block_counter: usize,
    erl_time_domain: DbMetric,
    erle_time_domain: DbMetric,
    saturated_capture: bool,
    pending: PendingReport,
    metrics_reported: bool,
}

impl EchoRemoverMetrics {
    pub(crate) fn new(instance_id: usize) -> Self {
        let mut metrics = Self {
            instance_id,
            block_counter: 0,
            erl_time_domain: DbMetric::default(),
            erle_time_domain: DbMetric::default(),
            saturated_capture: false,
            pending: PendingReport::default(),
            metrics_reported: false,
        };
        metrics.reset_metrics();
        metrics
    }

    pub(crate) fn update(&mut self, aec_state: &dyn EchoState) {
        self.metrics_reported = false;
        self.block_counter += 1;
        if self.block_counter <= METRICS_COLLECTION_BLOCKS {
            self.erl_time_domain.update(aec_state.erl_time_domain());
            self.erle_time_domain.update(aec_state.fullband_erle_log2());
            self.saturated_capture |= aec_state.saturated_capture();
            return;
        }

        // The logarithms are spread over the last blocks of the interval.
        match self.block_counter - METRICS_COLLECTION_BLOCKS {
            1 => {
                self.pending.usable_linear_estimate = aec_state.usable_linear_estimate();
                self.pending.filter_delay_blocks = aec_state.filter_delay_blocks();
            }
            2 => {
                const ONE_BY_COLLECTION_BLOCKS: f32 = 1.0 / METRICS_COLLECTION_BLOCKS as f32;
                let erl = |value| transform_db_metric_for_reporting(true, 0.0, 59.0, 0.0, 1.0, value);
                self.pending.erl_average =
                    erl(self.erl_time_domain.sum_value * ONE_BY_COLLECTION_BLOCKS);
                // Negation swaps floor and ceiling.
                self.pending.erl_max = erl(self.erl_time_domain.floor_value);
                self.pending.erl_min = erl(self.erl_time_domain.ceil_value);
            }
            3 => {
                self.report();
                self.metrics_reported = true;
                debug_assert_eq!(METRICS_REPORTING_INTERVAL_BLOCKS, self.block_counter);
                self.block_counter = 0;
                self.reset_metrics();
            }
            _ => debug_assert!(false, "unexpected block counter {}", self.block_counter),
        }
    }

    fn report(&self) {
        let erle_db = |log2: f32| log2_to_db(log2).clamp(0.0, 19.0) as i32;
        let erle_average =
            erle_db(self.erle_time_domain.sum_value / METRICS_COLLECTION_BLOCKS as f32);
        tracing::info!(
            instance_id = self.instance_id,
            erl_average_db = self.pending.erl_average,
            erl_min_db = self.pending.erl_min,
            erl_max_db = self.pending.erl_max,
            erle_average_db = erle_average,
            erle_min_db = erle_db(self.erle_time_domain.floor_value),
            erle_max_db = erle_db(self.erle_time_domain.ceil_value),
            saturated_capture = self.saturated_capture,
            usable_linear_estimate = self.pending.usable_linear_estimate,
            filter_delay_blocks = self.pending.filter_delay_blocks,
            "Echo remover metrics"
        );
    }

    /// Returns true if the metrics were reported on the latest block.
    pub(crate) fn metrics_reported(&self) -> bool {
        self.metrics_reported
    }

    fn reset_metrics(&mut self) {
        self.erl_time_domain = DbMetric::new(0.0, 10000.0, 0.0);
        self.erle_time_domain = DbMetric::new(0.0, 1000.0, 0.0);
        self.saturated_capture = false;
        self.pending = PendingReport::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_support::StaticEchoState;

    #[test]
    fn db_metric_constructor() {
        let metric = DbMetric::new(1.0, 2.0, 3.0);
        assert_eq!(metric.sum_value, 1.0);
        assert_eq!(metric.floor_value, 2.0);
        assert_eq!(metric.ceil_value, 3.0);
    }

    #[test]
    fn db_metric_update() {
        let mut metric = DbMetric::new(0.0, 20.0, -20.0);
        for _ in 0..100 {
            metric.update(10.0);
        }
        assert!((metric.sum_value - 1000.0).abs() < 1e-4);
        assert_eq!(metric.ceil_value, 10.0);
        assert_eq!(metric.floor_value, 10.0);
    }

    #[test]
    fn transform_db_metric_limits() {
        assert_eq!(transform_db_metric_for_reporting(false, 0.0, 10.0, 0.0, 1.0, 0.001), 0);
        assert_eq!(transform_db_metric_for_reporting(false, 0.0, 10.0, 0.0, 1.0, 100.0), 10);
    }

    #[test]
    fn transform_db_metric_negate() {
        assert_eq!(transform_db_metric_for_reporting(true, -20.0, 20.0, 0.0, 1.0, 0.1), 10);
        assert_eq!(transform_db_metric_for_reporting(true, -20.0, 20.0, 0.0, 1.0, 10.0), -10);
    }

    #[test]
    fn transform_db_metric_offset_and_scaling() {
        assert_eq!(transform_db_metric_for_reporting(false, -100.0, 100.0, 3.0, 10.0, 10.0), 23);
    }

    #[test]
    fn reports_once_per_interval() {
        let mut metrics = EchoRemoverMetrics::new(0);
        let state = StaticEchoState::new(1);

        for _ in 0..3 {
            for _ in 0..METRICS_REPORTING_INTERVAL_BLOCKS - 1 {
                metrics.update(&state);
                assert!(!metrics.metrics_reported());
            }
            metrics.update(&state);
            assert!(metrics.metrics_reported());
        }
        metrics.update(&state);
        assert!(!metrics.metrics_reported());
    }

    #[test]
    fn collects_floor_and_ceiling() {
        let mut metrics = EchoRemoverMetrics::new(0);
        let mut state = StaticEchoState::new(1);
        state.erl_time_domain = 0.5;
        metrics.update(&state);
        state.erl_time_domain = 0.01;
        metrics.update(&state);
        assert_eq!(metrics.erl_time_domain.floor_value, 0.01);
        assert_eq!(metrics.erl_time_domain.ceil_value, 0.5);
        assert!((metrics.erl_time_domain.sum_value - 0.51).abs() < 1e-6);
    }
}

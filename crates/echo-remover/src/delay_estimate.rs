/// Confidence of an externally supplied delay estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayEstimateQuality {
    Coarse,
    Refined,
}

/// Render-to-capture delay reported by an external delay estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayEstimate {
    pub quality: DelayEstimateQuality,
    /// Delay in blocks.
    pub delay: usize,
    pub blocks_since_last_change: usize,
    pub blocks_since_last_update: usize,
}

impl DelayEstimate {
    pub fn new(quality: DelayEstimateQuality, delay: usize) -> Self {
        Self {
            quality,
            delay,
            blocks_since_last_change: 0,
            blocks_since_last_update: 0,
        }
    }
}

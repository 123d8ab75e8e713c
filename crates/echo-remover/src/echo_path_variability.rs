/// Kind of render/capture alignment change reported for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelayAdjustment {
    #[default]
    None,
    /// The render buffer was flushed and re-aligned.
    BufferFlush,
    /// A new echo path delay was detected.
    NewDetectedDelay,
}

/// Echo path change event delivered with one capture block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EchoPathVariability {
    pub gain_change: bool,
    pub delay_change: DelayAdjustment,
}

impl EchoPathVariability {
    pub fn new(gain_change: bool, delay_change: DelayAdjustment) -> Self {
        Self {
            gain_change,
            delay_change,
        }
    }

    /// Returns whether the audio path has changed in gain or delay.
    pub fn audio_path_changed(&self) -> bool {
        self.gain_change || self.delay_change != DelayAdjustment::None
    }
}

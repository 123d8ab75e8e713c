//! Multi-band, multi-channel audio block.

use crate::common::BLOCK_SIZE;

/// One block of audio: `BLOCK_SIZE` samples for every band and channel.
///
/// Bands are 16 kHz sub-bands of the full-band signal; band 0 carries the
/// 0-8 kHz content that all spectral processing operates on.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    num_bands: usize,
    num_channels: usize,
    data: Vec<f32>,
}

impl Block {
    pub fn new(num_bands: usize, num_channels: usize) -> Self {
        Self::new_with_value(num_bands, num_channels, 0.0)
    }

    pub fn new_with_value(num_bands: usize, num_channels: usize, value: f32) -> Self {
        Self {
            num_bands,
            num_channels,
            data: vec![value; num_bands * num_channels * BLOCK_SIZE],
        }
    }

    pub fn num_bands(&self) -> usize {
        self.num_bands
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Returns the `BLOCK_SIZE` samples of one band and channel.
    pub fn view(&self, band: usize, channel: usize) -> &[f32] {
        let idx = self.get_index(band, channel);
        &self.data[idx..idx + BLOCK_SIZE]
    }

    pub fn view_mut(&mut self, band: usize, channel: usize) -> &mut [f32] {
        let idx = self.get_index(band, channel);
        &mut self.data[idx..idx + BLOCK_SIZE]
    }

    /// Copies all samples from `other`, which must have the same layout.
    pub(crate) fn copy_from(&mut self, other: &Block) {
        assert_eq!(self.num_bands, other.num_bands, "block band count mismatch");
        assert_eq!(
            self.num_channels, other.num_channels,
            "block channel count mismatch"
        );
        self.data.copy_from_slice(&other.data);
    }

    fn get_index(&self, band: usize, channel: usize) -> usize {
        debug_assert!(band < self.num_bands);
        debug_assert!(channel < self.num_channels);
        (band * self.num_channels + channel) * BLOCK_SIZE
    }
}

//! History of render blocks together with their spectra.
//!
//! The buffer is a ring of fixed size. Each [`RenderBuffer::insert`] stores a
//! new block and the rectangular-window transform of it and its predecessor,
//! which is what the partitioned adaptive filters and the power estimators
//! read. Lookups are relative to the read position: offset 0 is the block
//! aligned with the current capture block, larger offsets are older.

use crate::block::Block;
use crate::block_fft::{BlockFft, Window};
use crate::circular_buffer::RingIndex;
use crate::common::{BLOCK_SIZE, FFT_LENGTH_BY_2_PLUS_1};
use crate::config::EchoRemoverConfig;
use crate::fft_data::FftData;

/// Extra slots kept beyond the longest filter so that the echo model window
/// and the previous block of the transform stay available.
const HISTORY_MARGIN_BLOCKS: usize = 2;

#[derive(Debug)]
pub struct RenderBuffer {
    num_bands: usize,
    num_channels: usize,
    index: RingIndex,
    delay_blocks: usize,
    blocks: Vec<Block>,
    spectra: Vec<Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>>,
    ffts: Vec<Vec<FftData>>,
    fft: BlockFft,
}

impl RenderBuffer {
    /// Creates an empty (all-zero) buffer holding `size_blocks` blocks.
    pub fn new(num_bands: usize, num_channels: usize, size_blocks: usize) -> Self {
        assert!(size_blocks > 1, "render buffer needs room for at least two blocks");
        assert!(num_bands > 0, "render buffer needs at least one band");
        assert!(num_channels > 0, "render buffer needs at least one channel");
        Self {
            num_bands,
            num_channels,
            index: RingIndex::new(size_blocks),
            delay_blocks: 0,
            blocks: vec![Block::new(num_bands, num_channels); size_blocks],
            spectra: vec![vec![[0.0; FFT_LENGTH_BY_2_PLUS_1]; num_channels]; size_blocks],
            ffts: vec![vec![FftData::default(); num_channels]; size_blocks],
            fft: BlockFft::new(),
        }
    }

    /// Creates a buffer large enough for the filters and echo model in
    /// `config`.
    pub fn for_config(config: &EchoRemoverConfig, num_bands: usize, num_channels: usize) -> Self {
        Self::new(num_bands, num_channels, Self::required_size(config))
    }

    /// Ring size needed by the filters and the echo model in `config`.
    pub fn required_size(config: &EchoRemoverConfig) -> usize {
        let filter = &config.filter;
        let longest_filter = filter
            .main
            .length_blocks
            .max(filter.main_initial.length_blocks)
            .max(filter.shadow.length_blocks)
            .max(filter.shadow_initial.length_blocks);
        let echo_model_reach = config.delay.delay_headroom_samples / BLOCK_SIZE
            + longest_filter
            + config.echo_model.render_post_window_size;
        longest_filter.max(echo_model_reach) + HISTORY_MARGIN_BLOCKS
    }

    pub fn num_bands(&self) -> usize {
        self.num_bands
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Number of blocks held by the ring.
    pub fn size(&self) -> usize {
        self.index.size
    }

    /// Pushes the newest render block.
    pub fn insert(&mut self, block: &Block) {
        assert_eq!(
            self.num_bands,
            block.num_bands(),
            "render block band count mismatch"
        );
        assert_eq!(
            self.num_channels,
            block.num_channels(),
            "render block channel count mismatch"
        );

        self.index.dec_write();
        let write = self.index.write;
        let previous = self.index.inc_index(write);
        self.blocks[write].copy_from(block);

        for ch in 0..self.num_channels {
            self.fft.padded_fft(
                self.blocks[write].view(0, ch),
                self.blocks[previous].view(0, ch),
                Window::Rectangular,
                &mut self.ffts[write][ch],
            );
            self.ffts[write][ch].spectrum(&mut self.spectra[write][ch]);
        }

        self.index.set_read_delay(self.delay_blocks);
    }

    /// Aligns the read position `delay_blocks` behind the newest block.
    ///
    /// The delay is capped to the ring size minus one. Returns the delay that
    /// was applied.
    pub fn set_delay(&mut self, delay_blocks: usize) -> usize {
        let max_delay = self.index.size - 1;
        self.delay_blocks = delay_blocks.min(max_delay);
        self.index.set_read_delay(self.delay_blocks);
        self.delay_blocks
    }

    /// Number of inserted blocks newer than the read position.
    pub fn headroom(&self) -> usize {
        self.index.distance()
    }

    /// Block `offset` steps older than the read position.
    pub fn block(&self, offset: usize) -> &Block {
        &self.blocks[self.index.offset_index(self.index.read, offset)]
    }

    /// Per-channel power spectra `delay` steps older than the read position.
    pub fn spectrum(&self, delay: usize) -> &[[f32; FFT_LENGTH_BY_2_PLUS_1]] {
        &self.spectra[self.index.offset_index(self.index.read, delay)]
    }

    /// Per-channel transforms for filter partition `partition`.
    pub fn fft(&self, partition: usize) -> &[FftData] {
        &self.ffts[self.index.offset_index(self.index.read, partition)]
    }

    /// Sums the spectra of all channels over the `num_spectra` most recent
    /// positions.
    pub fn spectral_sum(&self, num_spectra: usize, x2: &mut [f32; FFT_LENGTH_BY_2_PLUS_1]) {
        x2.fill(0.0);
        let mut position = self.index.read;
        for _ in 0..num_spectra {
            accumulate_channels(&self.spectra[position], x2);
            position = self.index.inc_index(position);
        }
    }

    /// Computes two spectral sums at once; the longer one continues where the
    /// shorter one stops.
    pub fn spectral_sums(
        &self,
        num_spectra_shorter: usize,
        num_spectra_longer: usize,
        x2_shorter: &mut [f32; FFT_LENGTH_BY_2_PLUS_1],
        x2_longer: &mut [f32; FFT_LENGTH_BY_2_PLUS_1],
    ) {
        debug_assert!(num_spectra_shorter <= num_spectra_longer);
        x2_shorter.fill(0.0);
        let mut position = self.index.read;
        for _ in 0..num_spectra_shorter {
            accumulate_channels(&self.spectra[position], x2_shorter);
            position = self.index.inc_index(position);
        }
        x2_longer.copy_from_slice(x2_shorter);
        for _ in num_spectra_shorter..num_spectra_longer {
            accumulate_channels(&self.spectra[position], x2_longer);
            position = self.index.inc_index(position);
        }
    }
}

fn accumulate_channels(
    spectra: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
    x2: &mut [f32; FFT_LENGTH_BY_2_PLUS_1],
) {
    for channel_spectrum in spectra {
        for (out, &val) in x2.iter_mut().zip(channel_spectrum.iter()) {
            *out += val;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_block(num_channels: usize, value: f32) -> Block {
        Block::new_with_value(1, num_channels, value)
    }

    #[test]
    fn newest_block_is_at_offset_zero() {
        let mut buffer = RenderBuffer::new(1, 1, 4);
        for v in 1..=3 {
            buffer.insert(&constant_block(1, v as f32));
        }
        assert_eq!(buffer.block(0).view(0, 0)[0], 3.0);
        assert_eq!(buffer.block(1).view(0, 0)[0], 2.0);
        assert_eq!(buffer.block(2).view(0, 0)[0], 1.0);
        assert_eq!(buffer.block(3).view(0, 0)[0], 0.0);
    }

    #[test]
    fn spectrum_of_constant_block_after_silence() {
        let mut buffer = RenderBuffer::new(1, 1, 4);
        buffer.insert(&constant_block(1, 1.0));
        // Transform of 64 zeros followed by 64 ones: the DC bin holds the sum.
        assert!((buffer.fft(0)[0].re[0] - 64.0).abs() < 1e-3);
        assert!((buffer.spectrum(0)[0][0] - 64.0 * 64.0).abs() < 0.5);
        assert_eq!(buffer.spectrum(1)[0][0], 0.0);
    }

    #[test]
    fn spectral_sum_accumulates_all_channels() {
        let mut buffer = RenderBuffer::new(1, 2, 4);
        buffer.insert(&constant_block(2, 1.0));
        buffer.insert(&constant_block(2, 1.0));

        let mut x2 = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
        buffer.spectral_sum(2, &mut x2);

        // Newest: 128 ones, DC power 128². Previous: zeros then ones, 64².
        let expected = 2.0 * (128.0f32 * 128.0 + 64.0 * 64.0);
        assert!((x2[0] - expected).abs() / expected < 1e-4);
    }

    #[test]
    fn spectral_sums_shorter_is_prefix_of_longer() {
        let mut buffer = RenderBuffer::new(1, 1, 5);
        for v in 1..=4 {
            buffer.insert(&constant_block(1, v as f32));
        }

        let mut shorter = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
        let mut longer = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
        buffer.spectral_sums(2, 4, &mut shorter, &mut longer);

        let mut direct_short = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
        let mut direct_long = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
        buffer.spectral_sum(2, &mut direct_short);
        buffer.spectral_sum(4, &mut direct_long);
        assert_eq!(shorter, direct_short);
        assert_eq!(longer, direct_long);
        assert!(longer[0] > shorter[0]);
    }

    #[test]
    fn delay_moves_read_position_back() {
        let mut buffer = RenderBuffer::new(1, 1, 6);
        assert_eq!(buffer.set_delay(2), 2);
        for v in 1..=4 {
            buffer.insert(&constant_block(1, v as f32));
        }
        assert_eq!(buffer.headroom(), 2);
        assert_eq!(buffer.block(0).view(0, 0)[0], 2.0);
        assert_eq!(buffer.set_delay(100), 5);
    }

    #[test]
    fn required_size_covers_longest_filter() {
        let config = EchoRemoverConfig::default();
        let size = RenderBuffer::required_size(&config);
        assert!(size > config.filter.main.length_blocks);
        assert!(size > config.filter.shadow.length_blocks);
    }

    #[test]
    #[should_panic(expected = "render block channel count mismatch")]
    fn insert_rejects_wrong_channel_count() {
        let mut buffer = RenderBuffer::new(1, 2, 4);
        buffer.insert(&constant_block(1, 0.0));
    }
}

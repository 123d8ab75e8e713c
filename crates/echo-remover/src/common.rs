//! Block and transform dimensions shared by every stage of the echo remover.

pub(crate) const NUM_BLOCKS_PER_SECOND: usize = 250;

pub(crate) const METRICS_REPORTING_INTERVAL_BLOCKS: usize = 10 * NUM_BLOCKS_PER_SECOND;
pub(crate) const METRICS_COMPUTATION_BLOCKS: usize = 3;
pub(crate) const METRICS_COLLECTION_BLOCKS: usize =
    METRICS_REPORTING_INTERVAL_BLOCKS - METRICS_COMPUTATION_BLOCKS;

pub(crate) const FFT_LENGTH_BY_2: usize = 64;
pub const FFT_LENGTH_BY_2_PLUS_1: usize = FFT_LENGTH_BY_2 + 1;
pub(crate) const FFT_LENGTH_BY_2_MINUS_1: usize = FFT_LENGTH_BY_2 - 1;
pub(crate) const FFT_LENGTH: usize = 2 * FFT_LENGTH_BY_2;

/// Samples per band in one block (4 ms at 16 kHz).
pub const BLOCK_SIZE: usize = FFT_LENGTH_BY_2;

/// Maximum number of capture channels whose per-block working data is kept
/// inline rather than in a heap allocation.
pub(crate) const MAX_NUM_CHANNELS_INLINE: usize = 2;

const _: () = assert!(FFT_LENGTH == echo_fft::FFT_SIZE);
const _: () = assert!(FFT_LENGTH_BY_2_PLUS_1 == echo_fft::NUM_BINS);

/// Returns the number of 16 kHz bands for the given sample rate.
pub const fn num_bands_for_rate(sample_rate_hz: usize) -> usize {
    sample_rate_hz / 16000
}

/// Returns whether the given sample rate can be processed.
pub const fn valid_full_band_rate(sample_rate_hz: usize) -> bool {
    matches!(sample_rate_hz, 16000 | 32000 | 48000)
}

/// Returns the time-domain length corresponding to a filter length in blocks.
pub(crate) const fn get_time_domain_length(filter_length_blocks: usize) -> usize {
    filter_length_blocks * FFT_LENGTH_BY_2
}

/// Fast approximate log2 of a positive float, read off its bit pattern.
pub(crate) fn fast_approx_log2f(input: f32) -> f32 {
    debug_assert!(input > 0.0);
    let bits = input.to_bits();
    let out = bits as f32;
    out * 1.192_092_9e-7 - 126.942_695
}

/// Converts a log2-domain power quantity to decibels.
pub(crate) fn log2_to_db(in_log2: f32) -> f32 {
    3.010_299_956_639_812 * in_log2
}

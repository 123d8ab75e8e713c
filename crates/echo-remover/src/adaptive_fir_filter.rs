//! Partitioned frequency-domain adaptive FIR filter.
//!
//! The filter holds one 65-bin transfer function per partition and render
//! channel. Partition `p` multiplies the render transform `p` blocks older
//! than the read position of the [`RenderBuffer`].

use crate::block_fft::BlockFft;
use crate::common::{FFT_LENGTH, FFT_LENGTH_BY_2, FFT_LENGTH_BY_2_PLUS_1, get_time_domain_length};
use crate::fft_data::FftData;
use crate::render_buffer::RenderBuffer;

/// Stores in `h2[p]` the maximum over render channels of `|H[p]|²`.
pub(crate) fn compute_frequency_response(
    num_partitions: usize,
    h: &[Vec<FftData>],
    h2: &mut [[f32; FFT_LENGTH_BY_2_PLUS_1]],
) {
    for (h_p, h2_p) in h.iter().zip(h2.iter_mut()).take(num_partitions) {
        h2_p.fill(0.0);
        for h_p_ch in h_p {
            for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
                let power = h_p_ch.re[k] * h_p_ch.re[k] + h_p_ch.im[k] * h_p_ch.im[k];
                h2_p[k] = h2_p[k].max(power);
            }
        }
    }
}

/// `H[p] += conj(X[p]) · G` for every partition and render channel.
pub(crate) fn adapt_partitions(
    render_buffer: &RenderBuffer,
    g: &FftData,
    num_partitions: usize,
    h: &mut [Vec<FftData>],
) {
    for (p, h_p) in h.iter_mut().enumerate().take(num_partitions) {
        for (x_p_ch, h_p_ch) in render_buffer.fft(p).iter().zip(h_p.iter_mut()) {
            for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
                h_p_ch.re[k] += x_p_ch.re[k] * g.re[k] + x_p_ch.im[k] * g.im[k];
                h_p_ch.im[k] += x_p_ch.re[k] * g.im[k] - x_p_ch.im[k] * g.re[k];
            }
        }
    }
}

/// `S = Σ_p H[p] · X[p]`, summed over render channels.
pub(crate) fn apply_filter(
    render_buffer: &RenderBuffer,
    num_partitions: usize,
    h: &[Vec<FftData>],
    s: &mut FftData,
) {
    s.clear();
    for (p, h_p) in h.iter().enumerate().take(num_partitions) {
        for (x_p_ch, h_p_ch) in render_buffer.fft(p).iter().zip(h_p.iter()) {
            for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
                s.re[k] += x_p_ch.re[k] * h_p_ch.re[k] - x_p_ch.im[k] * h_p_ch.im[k];
                s.im[k] += x_p_ch.re[k] * h_p_ch.im[k] + x_p_ch.im[k] * h_p_ch.re[k];
            }
        }
    }
}

/// Echo return loss of a filter: the sum of its partition responses.
pub(crate) fn compute_erl(
    h2: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
    erl: &mut [f32; FFT_LENGTH_BY_2_PLUS_1],
) {
    erl.fill(0.0);
    for h2_p in h2 {
        for (erl_k, &h2_pk) in erl.iter_mut().zip(h2_p.iter()) {
            *erl_k += h2_pk;
        }
    }
}

fn zero_filter(old_size: usize, new_size: usize, h: &mut [Vec<FftData>]) {
    for h_p in h.iter_mut().take(new_size).skip(old_size) {
        for h_p_ch in h_p {
            h_p_ch.clear();
        }
    }
}

#[derive(Debug)]
pub(crate) struct AdaptiveFirFilter {
    fft: BlockFft,
    max_size_partitions: usize,
    size_change_duration_blocks: i32,
    one_by_size_change_duration_blocks: f32,
    current_size_partitions: usize,
    target_size_partitions: usize,
    old_target_size_partitions: usize,
    size_change_counter: i32,
    h: Vec<Vec<FftData>>,
    partition_to_constrain: usize,
}

impl AdaptiveFirFilter {
    pub(crate) fn new(
        max_size_partitions: usize,
        initial_size_partitions: usize,
        size_change_duration_blocks: usize,
        num_render_channels: usize,
    ) -> Self {
        debug_assert!(max_size_partitions >= initial_size_partitions);
        debug_assert!(size_change_duration_blocks > 0);
        debug_assert!(initial_size_partitions > 0);

        let mut filter = Self {
            fft: BlockFft::new(),
            max_size_partitions,
            size_change_duration_blocks: size_change_duration_blocks as i32,
            one_by_size_change_duration_blocks: 1.0 / size_change_duration_blocks as f32,
            current_size_partitions: initial_size_partitions,
            target_size_partitions: initial_size_partitions,
            old_target_size_partitions: initial_size_partitions,
            size_change_counter: 0,
            h: vec![vec![FftData::default(); num_render_channels]; max_size_partitions],
            partition_to_constrain: 0,
        };
        filter.set_size_partitions(initial_size_partitions, true);
        filter
    }

    /// Computes the filter output spectrum.
    pub(crate) fn filter(&self, render_buffer: &RenderBuffer, s: &mut FftData) {
        apply_filter(render_buffer, self.current_size_partitions, &self.h, s);
    }

    pub(crate) fn adapt(&mut self, render_buffer: &RenderBuffer, g: &FftData) {
        self.adapt_and_update_size(render_buffer, g);
        self.constrain();
    }

    /// Adapts the filter and refreshes the slice of `impulse_response` that
    /// belongs to the partition constrained in this call.
    pub(crate) fn adapt_with_impulse_response(
        &mut self,
        render_buffer: &RenderBuffer,
        g: &FftData,
        impulse_response: &mut Vec<f32>,
    ) {
        self.adapt_and_update_size(render_buffer, g);
        self.constrain_and_update_impulse_response(impulse_response);
    }

    /// Clears the partitions beyond the current size.
    pub(crate) fn handle_echo_path_change(&mut self) {
        zero_filter(self.current_size_partitions, self.max_size_partitions, &mut self.h);
    }

    pub(crate) fn size_partitions(&self) -> usize {
        self.current_size_partitions
    }

    /// Sets the target size. Without `immediate_effect` the size moves there
    /// linearly over the configured change duration.
    pub(crate) fn set_size_partitions(&mut self, size: usize, immediate_effect: bool) {
        self.target_size_partitions = size.clamp(1, self.max_size_partitions);
        if immediate_effect {
            let old_size = self.current_size_partitions;
            self.current_size_partitions = self.target_size_partitions;
            self.old_target_size_partitions = self.target_size_partitions;
            zero_filter(old_size, self.current_size_partitions, &mut self.h);
            self.partition_to_constrain = self
                .partition_to_constrain
                .min(self.current_size_partitions - 1);
            self.size_change_counter = 0;
        } else {
            self.size_change_counter = self.size_change_duration_blocks;
        }
    }

    /// Fills `h2` with one frequency response per current partition.
    pub(crate) fn compute_frequency_response(&self, h2: &mut Vec<[f32; FFT_LENGTH_BY_2_PLUS_1]>) {
        h2.resize(self.current_size_partitions, [0.0; FFT_LENGTH_BY_2_PLUS_1]);
        compute_frequency_response(self.current_size_partitions, &self.h, h2);
    }

    #[cfg(test)]
    pub(crate) fn max_filter_size_partitions(&self) -> usize {
        self.max_size_partitions
    }

    pub(crate) fn scale_filter(&mut self, factor: f32) {
        for h_p_ch in self.h.iter_mut().flatten() {
            h_p_ch.re.iter_mut().for_each(|v| *v *= factor);
            h_p_ch.im.iter_mut().for_each(|v| *v *= factor);
        }
    }

    /// Copies the first `num_partitions` partitions of `h`, limited to the
    /// current size.
    pub(crate) fn set_filter(&mut self, num_partitions: usize, h: &[Vec<FftData>]) {
        let num_partitions = self.current_size_partitions.min(num_partitions);
        for (dst, src) in self.h.iter_mut().zip(h).take(num_partitions) {
            debug_assert_eq!(dst.len(), src.len());
            for (dst_ch, src_ch) in dst.iter_mut().zip(src) {
                dst_ch.assign(src_ch);
            }
        }
    }

    pub(crate) fn get_filter(&self) -> &[Vec<FftData>] {
        &self.h
    }

    fn adapt_and_update_size(&mut self, render_buffer: &RenderBuffer, g: &FftData) {
        self.update_size();
        adapt_partitions(render_buffer, g, self.current_size_partitions, &mut self.h);
    }

    fn update_size(&mut self) {
        let old_size = self.current_size_partitions;
        if self.size_change_counter > 0 {
            self.size_change_counter -= 1;
            let change_factor =
                self.size_change_counter as f32 * self.one_by_size_change_duration_blocks;
            let interpolated = self.old_target_size_partitions as f32 * change_factor
                + self.target_size_partitions as f32 * (1.0 - change_factor);
            self.current_size_partitions = (interpolated as usize).max(1);
            self.partition_to_constrain = self
                .partition_to_constrain
                .min(self.current_size_partitions - 1);
        } else {
            self.current_size_partitions = self.target_size_partitions;
            self.old_target_size_partitions = self.target_size_partitions;
        }
        zero_filter(old_size, self.current_size_partitions, &mut self.h);
    }

    /// Zeroes the second half of the impulse response of the partition to
    /// constrain for channel `ch`, leaving the constrained response in `h_td`.
    fn constrain_partition(&mut self, ch: usize, h_td: &mut [f32; FFT_LENGTH]) {
        let p = self.partition_to_constrain;
        self.fft.ifft(&self.h[p][ch], h_td);
        const SCALE: f32 = 1.0 / FFT_LENGTH_BY_2 as f32;
        h_td[..FFT_LENGTH_BY_2].iter_mut().for_each(|v| *v *= SCALE);
        h_td[FFT_LENGTH_BY_2..].fill(0.0);
        self.fft.fft(h_td, &mut self.h[p][ch]);
    }

    fn advance_partition_to_constrain(&mut self) {
        self.partition_to_constrain = if self.partition_to_constrain + 1 < self.current_size_partitions
        {
            self.partition_to_constrain + 1
        } else {
            0
        };
    }

    fn constrain(&mut self) {
        let mut h_td = [0.0f32; FFT_LENGTH];
        for ch in 0..self.h[self.partition_to_constrain].len() {
            self.constrain_partition(ch, &mut h_td);
        }
        self.advance_partition_to_constrain();
    }

    fn constrain_and_update_impulse_response(&mut self, impulse_response: &mut Vec<f32>) {
        impulse_response.resize(get_time_domain_length(self.current_size_partitions), 0.0);
        let start = self.partition_to_constrain * FFT_LENGTH_BY_2;
        let ir = &mut impulse_response[start..start + FFT_LENGTH_BY_2];
        ir.fill(0.0);

        let mut h_td = [0.0f32; FFT_LENGTH];
        for ch in 0..self.h[self.partition_to_constrain].len() {
            self.constrain_partition(ch, &mut h_td);
            // Keep the coefficient with the largest magnitude across channels.
            for (ir_k, &h_k) in ir.iter_mut().zip(&h_td[..FFT_LENGTH_BY_2]) {
                if ch == 0 || ir_k.abs() < h_k.abs() {
                    *ir_k = h_k;
                }
            }
        }
        self.advance_partition_to_constrain();
    }
}

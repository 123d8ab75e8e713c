//! Residual echo power estimation.

use crate::collaborators::EchoState;
use crate::common::FFT_LENGTH_BY_2_PLUS_1;
use crate::config::{EchoModel, EchoRemoverConfig};
use crate::render_buffer::RenderBuffer;

/// Scales the linear echo estimate down by the achieved enhancement.
fn linear_estimate(
    s2_linear: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
    erle: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
    r2: &mut [[f32; FFT_LENGTH_BY_2_PLUS_1]],
) {
    debug_assert_eq!(s2_linear.len(), erle.len());
    for ((r2_ch, s2_ch), erle_ch) in r2.iter_mut().zip(s2_linear).zip(erle) {
        for k in 0..FFT_LENGTH_BY_2_PLUS_1 {
            debug_assert!(erle_ch[k] > 0.0);
            r2_ch[k] = s2_ch[k] / erle_ch[k];
        }
    }
}

fn non_linear_estimate(
    echo_path_gain: f32,
    x2: &[f32; FFT_LENGTH_BY_2_PLUS_1],
    r2: &mut [[f32; FFT_LENGTH_BY_2_PLUS_1]],
) {
    for r2_ch in r2 {
        for (r, &x) in r2_ch.iter_mut().zip(x2) {
            *r = x * echo_path_gain;
        }
    }
}

/// Soft gate that pushes render power below the gate level towards zero.
fn apply_noise_gate(config: &EchoModel, x2: &mut [f32; FFT_LENGTH_BY_2_PLUS_1]) {
    for x in x2.iter_mut() {
        if config.noise_gate_power > *x {
            *x = (*x - config.noise_gate_slope * (config.noise_gate_power - *x)).max(0.0);
        }
    }
}

/// Maximum channel-summed render power over the blocks around the echo delay.
fn echo_generating_power(
    render_buffer: &RenderBuffer,
    echo_model: &EchoModel,
    filter_delay_blocks: usize,
    x2: &mut [f32; FFT_LENGTH_BY_2_PLUS_1],
) {
    let window_start = filter_delay_blocks.saturating_sub(echo_model.render_pre_window_size);
    let window_end =
        (filter_delay_blocks + echo_model.render_post_window_size).min(render_buffer.size() - 1);

    x2.fill(0.0);
    for position in window_start..=window_end {
        let mut render_power = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
        for channel_power in render_buffer.spectrum(position) {
            for (p, &c) in render_power.iter_mut().zip(channel_power) {
                *p += c;
            }
        }
        for (x, &p) in x2.iter_mut().zip(&render_power) {
            *x = x.max(p);
        }
    }
}

/// Default residual echo estimator.
///
/// With a usable linear filter the residual is the linear echo estimate
/// divided by the ERLE. Otherwise it is modelled from the render power around
/// the echo delay times a fixed echo path gain. Saturated echo is assumed to
/// have the capture signal's spectrum.
#[derive(Debug)]
pub struct ResidualEchoEstimator {
    echo_model: EchoModel,
    echo_path_gain: f32,
}

impl ResidualEchoEstimator {
    pub fn new(config: &EchoRemoverConfig) -> Self {
        Self {
            echo_model: config.echo_model.clone(),
            echo_path_gain: config.ep_strength.default_gain,
        }
    }

    pub fn estimate(
        &mut self,
        aec_state: &dyn EchoState,
        render_buffer: &RenderBuffer,
        s2_linear: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        y2: &[[f32; FFT_LENGTH_BY_2_PLUS_1]],
        r2: &mut [[f32; FFT_LENGTH_BY_2_PLUS_1]],
    ) {
        debug_assert_eq!(r2.len(), y2.len());
        debug_assert_eq!(r2.len(), s2_linear.len());

        if aec_state.saturated_echo() {
            r2.copy_from_slice(y2);
            return;
        }

        if aec_state.usable_linear_estimate() {
            linear_estimate(s2_linear, aec_state.erle(), r2);
        } else {
            let mut x2 = [0.0f32; FFT_LENGTH_BY_2_PLUS_1];
            echo_generating_power(
                render_buffer,
                &self.echo_model,
                aec_state.filter_delay_blocks(),
                &mut x2,
            );
            apply_noise_gate(&self.echo_model, &mut x2);
            non_linear_estimate(self.echo_path_gain, &x2, r2);
        }
    }
}

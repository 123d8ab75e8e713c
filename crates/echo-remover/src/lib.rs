//! Block-based acoustic echo remover.
//!
//! [`EchoRemover`] removes the echo of a loudspeaker (render) signal from a
//! microphone (capture) signal, one 64-sample block at a time. Each block
//! goes through linear adaptive cancellation, residual echo suppression and
//! comfort noise injection. The stages are reached through the object-safe
//! traits in [`collaborators`], and every trait has a default implementation
//! in this crate.
//!
//! ```no_run
//! use echo_remover::{Block, EchoPathVariability, EchoRemover, EchoRemoverConfig, RenderBuffer};
//!
//! let config = EchoRemoverConfig::default();
//! let mut remover = EchoRemover::new(&config, 16000, 1, 1, 0)?;
//! let mut render_buffer = RenderBuffer::for_config(&config, 1, 1);
//! let mut capture = Block::new(1, 1);
//!
//! render_buffer.insert(&Block::new(1, 1));
//! remover.process_capture(
//!     EchoPathVariability::default(),
//!     false,
//!     None,
//!     &render_buffer,
//!     None,
//!     &mut capture,
//! );
//! # Ok::<(), echo_remover::Error>(())
//! ```

pub(crate) mod adaptive_fir_filter;
pub(crate) mod aec_state;
pub(crate) mod block;
pub(crate) mod block_fft;
pub(crate) mod channels;
pub(crate) mod circular_buffer;
pub mod collaborators;
pub(crate) mod comfort_noise_generator;
pub(crate) mod common;
pub mod config;
pub(crate) mod delay_estimate;
pub(crate) mod echo_path_variability;
pub(crate) mod echo_remover;
pub(crate) mod echo_remover_metrics;
pub(crate) mod erl_estimator;
pub(crate) mod erle_estimator;
pub(crate) mod error;
pub(crate) mod fft_data;
pub(crate) mod main_filter_update_gain;
pub(crate) mod render_buffer;
pub(crate) mod render_signal_analyzer;
pub(crate) mod residual_echo_estimator;
pub(crate) mod selector;
pub(crate) mod shadow_filter_update_gain;
pub(crate) mod subtractor;
pub(crate) mod subtractor_output;
pub(crate) mod subtractor_output_analyzer;
pub(crate) mod suppression_filter;
pub(crate) mod suppression_gain;

pub use aec_state::AecState;
pub use block::Block;
pub use collaborators::{
    ComfortNoise, EchoState, GainComputer, LinearCanceller, OutputSynthesis, RenderAnalyzer,
    ResidualEstimator,
};
pub use comfort_noise_generator::ComfortNoiseGenerator;
pub use common::{BLOCK_SIZE, FFT_LENGTH_BY_2_PLUS_1, num_bands_for_rate};
pub use config::EchoRemoverConfig;
pub use delay_estimate::{DelayEstimate, DelayEstimateQuality};
pub use echo_path_variability::{DelayAdjustment, EchoPathVariability};
pub use echo_remover::{Components, EchoMetrics, EchoRemover};
pub use error::Error;
pub use fft_data::FftData;
pub use render_buffer::RenderBuffer;
pub use render_signal_analyzer::RenderSignalAnalyzer;
pub use residual_echo_estimator::ResidualEchoEstimator;
pub use subtractor::Subtractor;
pub use subtractor_output::SubtractorOutput;
pub use suppression_filter::SuppressionFilter;
pub use suppression_gain::SuppressionGain;

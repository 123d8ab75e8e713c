//! Glitch-free switching between alternative signal estimates.

/// Number of samples over which a changed selection is crossfaded.
pub(crate) const TRANSITION_SIZE: usize = 30;
const ONE_BY_TRANSITION_SIZE_PLUS_ONE: f32 = 1.0 / (TRANSITION_SIZE + 1) as f32;

/// Which linear filter output forms the cancelled signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FilterOutput {
    Main,
    Shadow,
}

/// Which signal is fed to the suppressor and forms the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessingPath {
    Linear,
    Original,
}

/// How the output moves from the previous block's selection to the current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition<S> {
    /// The selection is unchanged.
    Cut(S),
    Crossfade { from: S, to: S },
}

/// Remembers the latest selection and reports how to reach a new one.
#[derive(Debug, Clone)]
pub(crate) struct OutputSelector<S> {
    selected: S,
}

impl<S: Copy + Eq> OutputSelector<S> {
    pub(crate) fn new(initial: S) -> Self {
        Self { selected: initial }
    }

    pub(crate) fn selected(&self) -> S {
        self.selected
    }

    pub(crate) fn select(&mut self, new: S) -> Transition<S> {
        let previous = std::mem::replace(&mut self.selected, new);
        if previous == new {
            Transition::Cut(new)
        } else {
            Transition::Crossfade {
                from: previous,
                to: new,
            }
        }
    }
}

/// Ramps linearly from `from` to `to` over the first [`TRANSITION_SIZE`]
/// samples and copies `to` for the rest.
pub(crate) fn blend(from: &[f32], to: &[f32], out: &mut [f32]) {
    debug_assert_eq!(from.len(), to.len());
    debug_assert_eq!(from.len(), out.len());
    debug_assert!(TRANSITION_SIZE <= out.len());

    for k in 0..TRANSITION_SIZE {
        let a = (k + 1) as f32 * ONE_BY_TRANSITION_SIZE_PLUS_ONE;
        out[k] = a * to[k] + (1.0 - a) * from[k];
    }
    out[TRANSITION_SIZE..].copy_from_slice(&to[TRANSITION_SIZE..]);
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_strategy::proptest;

    use super::*;
    use crate::common::BLOCK_SIZE;

    #[test]
    fn unchanged_selection_is_a_cut() {
        let mut selector = OutputSelector::new(FilterOutput::Main);
        assert_eq!(selector.select(FilterOutput::Main), Transition::Cut(FilterOutput::Main));
        assert_eq!(selector.selected(), FilterOutput::Main);
    }

    #[test]
    fn changed_selection_crossfades_once() {
        let mut selector = OutputSelector::new(ProcessingPath::Original);
        assert_eq!(
            selector.select(ProcessingPath::Linear),
            Transition::Crossfade {
                from: ProcessingPath::Original,
                to: ProcessingPath::Linear
            }
        );
        assert_eq!(selector.select(ProcessingPath::Linear), Transition::Cut(ProcessingPath::Linear));
        assert_eq!(
            selector.select(ProcessingPath::Original),
            Transition::Crossfade {
                from: ProcessingPath::Linear,
                to: ProcessingPath::Original
            }
        );
    }

    #[test]
    fn blend_ramp_endpoints() {
        let from = [0.0f32; BLOCK_SIZE];
        let to = [1.0f32; BLOCK_SIZE];
        let mut out = [0.0f32; BLOCK_SIZE];
        blend(&from, &to, &mut out);
        assert!((out[0] - 1.0 / 31.0).abs() < 1e-6);
        assert!((out[29] - 30.0 / 31.0).abs() < 1e-6);
        assert!(out[TRANSITION_SIZE..].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn blend_of_equal_signals_is_identity() {
        let x: [f32; BLOCK_SIZE] = std::array::from_fn(|k| k as f32 - 20.0);
        let mut out = [0.0f32; BLOCK_SIZE];
        blend(&x, &x, &mut out);
        for (a, b) in out.iter().zip(&x) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[proptest]
    fn blend_lies_between_candidates(
        #[strategy(proptest::collection::vec(-1000.0f32..1000.0, BLOCK_SIZE))] from: Vec<f32>,
        #[strategy(proptest::collection::vec(
            prop_oneof![-1000.0f32..-1.0, 1.0f32..1000.0],
            BLOCK_SIZE
        ))]
        delta: Vec<f32>,
    ) {
        let to: Vec<f32> = from.iter().zip(&delta).map(|(f, d)| f + d).collect();
        let mut out = vec![0.0f32; BLOCK_SIZE];
        blend(&from, &to, &mut out);

        for k in 0..TRANSITION_SIZE {
            let lo = from[k].min(to[k]);
            let hi = from[k].max(to[k]);
            prop_assert!(lo < out[k] && out[k] < hi, "sample {}: {} not in ({}, {})", k, out[k], lo, hi);
        }
        prop_assert_eq!(&out[TRANSITION_SIZE..], &to[TRANSITION_SIZE..]);
    }

    #[proptest]
    fn blend_moves_monotonically_towards_target(
        #[strategy(-1000.0f32..1000.0)] from: f32,
        #[strategy(-1000.0f32..1000.0)] to: f32,
    ) {
        let mut out = [0.0f32; BLOCK_SIZE];
        blend(&[from; BLOCK_SIZE], &[to; BLOCK_SIZE], &mut out);
        for k in 1..TRANSITION_SIZE {
            prop_assert!((to - out[k]).abs() <= (to - out[k - 1]).abs() + 1e-3);
        }
    }
}

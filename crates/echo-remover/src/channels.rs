//! Per-channel working storage that is sized once at construction.
//!
//! Mono and stereo capture keep their per-block scratch data inline in the
//! owning struct. Larger channel counts use one heap allocation of exactly the
//! channel count. Either way the data is reached through `Deref<Target = [T]>`,
//! so processing code indexes it like any slice.

use std::ops::{Deref, DerefMut};

use crate::common::MAX_NUM_CHANNELS_INLINE;

#[derive(Debug, Clone)]
pub(crate) enum ChannelBuffer<T> {
    Inline {
        data: [T; MAX_NUM_CHANNELS_INLINE],
        len: usize,
    },
    Heap(Box<[T]>),
}

impl<T: Default> ChannelBuffer<T> {
    pub(crate) fn new(num_channels: usize) -> Self {
        Self::from_fn(num_channels, |_| T::default())
    }
}

impl<T> ChannelBuffer<T> {
    pub(crate) fn from_fn(num_channels: usize, mut f: impl FnMut(usize) -> T) -> Self {
        if num_channels <= MAX_NUM_CHANNELS_INLINE {
            Self::Inline {
                data: std::array::from_fn(&mut f),
                len: num_channels,
            }
        } else {
            Self::Heap((0..num_channels).map(f).collect())
        }
    }

    #[cfg(test)]
    pub(crate) fn is_inline(&self) -> bool {
        matches!(self, Self::Inline { .. })
    }
}

impl<T> Deref for ChannelBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match self {
            Self::Inline { data, len } => &data[..*len],
            Self::Heap(data) => data,
        }
    }
}

impl<T> DerefMut for ChannelBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        match self {
            Self::Inline { data, len } => &mut data[..*len],
            Self::Heap(data) => data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_channel_counts_are_inline() {
        for n in 1..=MAX_NUM_CHANNELS_INLINE {
            let buf = ChannelBuffer::<[f32; 4]>::new(n);
            assert!(buf.is_inline());
            assert_eq!(buf.len(), n);
        }
    }

    #[test]
    fn large_channel_counts_use_exactly_sized_heap_storage() {
        let buf = ChannelBuffer::<f32>::new(8);
        assert!(!buf.is_inline());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn both_backings_behave_as_slices() {
        for n in [1, 2, 3, 8] {
            let mut buf = ChannelBuffer::from_fn(n, |ch| ch as f32);
            for (ch, v) in buf.iter_mut().enumerate() {
                *v += ch as f32;
            }
            let expected: Vec<f32> = (0..n).map(|ch| 2.0 * ch as f32).collect();
            assert_eq!(&buf[..], &expected[..]);
        }
    }
}

//! Index arithmetic for the fixed-size rings inside the render buffer.

/// Read and write cursors over a ring of `size` slots.
///
/// Newer entries are written at decreasing indices, so stepping an index
/// forward with [`RingIndex::inc_index`] walks towards older data.
#[derive(Debug, Clone)]
pub(crate) struct RingIndex {
    pub size: usize,
    pub write: usize,
    pub read: usize,
}

impl RingIndex {
    pub(crate) fn new(size: usize) -> Self {
        debug_assert!(size > 0);
        Self {
            size,
            write: 0,
            read: 0,
        }
    }

    pub(crate) fn inc_index(&self, index: usize) -> usize {
        if index < self.size - 1 { index + 1 } else { 0 }
    }

    pub(crate) fn dec_index(&self, index: usize) -> usize {
        if index > 0 { index - 1 } else { self.size - 1 }
    }

    /// Moves `index` forward by `offset` slots, wrapping around.
    pub(crate) fn offset_index(&self, index: usize, offset: usize) -> usize {
        (index + offset) % self.size
    }

    pub(crate) fn dec_write(&mut self) {
        self.write = self.dec_index(self.write);
    }

    /// Places the read cursor `delay` slots behind the write cursor.
    pub(crate) fn set_read_delay(&mut self, delay: usize) {
        debug_assert!(delay < self.size);
        self.read = self.offset_index(self.write, delay);
    }

    /// Number of slots between the write cursor and the read cursor.
    pub(crate) fn distance(&self) -> usize {
        if self.read >= self.write {
            self.read - self.write
        } else {
            self.size - self.write + self.read
        }
    }
}

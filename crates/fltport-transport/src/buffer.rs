/// Exclusively owned block of memory handed to one native operation at a time.
///
/// The full capacity is always backed by initialized storage so it can be
/// given to a native call as an output region; `len` tracks how much of it
/// holds meaningful data. Growing preserves the logical contents.
#[derive(Debug, Default)]
pub struct Buffer {
    storage: Vec<u8>,
    len: usize,
}

impl Buffer {
    /// Allocate a zero-filled buffer of `capacity` bytes with no logical content.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity],
            len: 0,
        }
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            storage: bytes.to_vec(),
            len: bytes.len(),
        }
    }

    /// Total bytes available to a native call.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes of logical content.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grow to at least `capacity` bytes. Never shrinks.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.storage.len() {
            self.storage.resize(capacity, 0);
        }
    }

    /// Logical content.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// The whole backing region, for a native call to fill.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    /// Record how many bytes a native call wrote. Clamped to capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.storage.len());
    }

    /// Replace the logical content with `bytes`, growing if needed.
    pub fn fill_from(&mut self, bytes: &[u8]) {
        self.ensure_capacity(bytes.len());
        self.storage[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

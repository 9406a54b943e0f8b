use crate::protocol_common::{
    AllocationSnafu, BufferError, CapacityExceededSnafu,
    INITIAL_BUFFER_CAPACITY, TERMINATOR,
};

/// Growable byte block holding the message currently being reassembled.
///
/// The block is always `capacity` bytes long and zero filled past `len`, so
/// the content is nul terminated at every point. Growth doubles the block.
/// Every allocation goes through `try_reserve_exact` so running out of memory
/// inside the signal handler is an error value, not an abort.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    block: Vec<u8>,
    len: usize,
    limit: Option<usize>,
}

impl MessageBuffer {
    /// No block allocated yet. Usable in a `static` initializer.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            block: Vec::new(),
            len: 0,
            limit: None,
        }
    }

    /// Cap on the capacity growth may reach. The initial block is always
    /// allowed.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.block.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.block[..self.len]
    }

    /// Content plus its terminator, or `None` while no block is allocated.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn as_bytes_with_nul(&self) -> Option<&[u8]> {
        (self.len < self.block.len()).then(|| &self.block[..=self.len])
    }

    fn allocate(capacity: usize) -> Result<Vec<u8>, BufferError> {
        let mut block = Vec::new();
        block
            .try_reserve_exact(capacity)
            .map_err(|_| AllocationSnafu { requested: capacity }.build())?;
        block.resize(capacity, TERMINATOR);
        Ok(block)
    }

    /// Make room for one more byte plus the terminator.
    ///
    /// On failure the current block and its content are left as they were.
    pub fn ensure_capacity(&mut self) -> Result<(), BufferError> {
        if self.len + 1 < self.capacity() {
            return Ok(());
        }

        let requested = match self.capacity() {
            0 => INITIAL_BUFFER_CAPACITY,
            cap => cap
                .checked_mul(2)
                .ok_or(BufferError::Allocation { requested: usize::MAX })?,
        };
        let growing = self.capacity() != 0;
        if let Some(limit) = self.limit.filter(|l| growing && requested > *l) {
            return CapacityExceededSnafu { requested, limit }.fail();
        }

        let mut grown = Self::allocate(requested)?;
        grown[..self.len].copy_from_slice(&self.block[..self.len]);
        // old block is released only once the copy is in place
        self.block = grown;
        Ok(())
    }

    pub fn append(&mut self, byte: u8) -> Result<(), BufferError> {
        self.ensure_capacity()?;
        self.block[self.len] = byte;
        self.len += 1;
        self.block[self.len] = TERMINATOR;
        Ok(())
    }

    /// Drop the current block and start over with a fresh, empty block of
    /// the initial capacity. If that allocation fails the buffer is left with
    /// no block at all; a later `append` or `reset` tries again.
    pub fn reset(&mut self) -> Result<(), BufferError> {
        self.release();
        self.block = Self::allocate(INITIAL_BUFFER_CAPACITY)?;
        Ok(())
    }

    pub fn release(&mut self) {
        self.block = Vec::new();
        self.len = 0;
    }
}

//! Reserved memory blocks
//!
//! A block is a heap buffer that is allocated fallibly and then written page
//! by page so the kernel actually backs it with resident memory.

use crate::models::BYTES_PER_MB;
use std::fmt;
use thiserror::Error;

const PAGE_SIZE: usize = 4096;

/// Non-zero so the pages can't be served from the shared zero page
const FILL_PATTERN: u8 = 0xA5;

/// Errors raised while reserving a memory block
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("requested block size resolves to zero bytes")]
    ZeroSize,

    #[error("insufficient memory for a block of {bytes} bytes: {reason}")]
    OutOfMemory { bytes: usize, reason: String },
}

/// An owned, touched region of memory
pub struct MemoryBlock {
    data: Vec<u8>,
}

impl MemoryBlock {
    /// Reserve a block of `size_mb` megabytes
    pub fn allocate_mb(size_mb: f64) -> Result<Self, AllocationError> {
        Self::allocate(mb_to_bytes(size_mb))
    }

    /// Reserve a block of exactly `bytes` bytes
    pub fn allocate(bytes: usize) -> Result<Self, AllocationError> {
        if bytes == 0 {
            return Err(AllocationError::ZeroSize);
        }

        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|e| AllocationError::OutOfMemory {
                bytes,
                reason: e.to_string(),
            })?;
        data.resize(bytes, FILL_PATTERN);

        let mut block = Self { data };
        block.touch();
        Ok(block)
    }

    /// Size of the block in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Write one byte per page to keep every page resident
    pub fn touch(&mut self) {
        for offset in (0..self.data.len()).step_by(PAGE_SIZE) {
            self.data[offset] = self.data[offset].wrapping_add(1);
        }
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Convert megabytes to bytes, mapping negative or non-finite sizes to zero
pub fn mb_to_bytes(size_mb: f64) -> usize {
    if !size_mb.is_finite() || size_mb <= 0.0 {
        return 0;
    }
    (size_mb * BYTES_PER_MB as f64) as usize
}

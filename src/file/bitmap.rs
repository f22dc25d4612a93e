//! Chunk completion bitmap.
//!
//! One bit per chunk, `1` = pending and `0` = written. Bit `i` lives in byte
//! `i / 8` at position `7 - (i % 8)`, so bit 0 is the high bit of byte 0.
//! Padding bits past the last chunk are always `0`, which lets
//! [`ChunkBitmap::is_all_zero`] answer "upload finished" by looking at bytes.

use thiserror::Error;

use crate::VaultError;

/// Bitmap errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitmapError {
    /// Bit index beyond the bitmap's capacity.
    #[error("bit index {index} out of range (capacity {capacity})")]
    IndexOutOfRange { index: u64, capacity: u64 },
}

impl From<BitmapError> for VaultError {
    fn from(e: BitmapError) -> Self {
        VaultError::Validation(e.to_string())
    }
}

/// Per-chunk completion state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    bytes: Vec<u8>,
}

impl ChunkBitmap {
    /// Bytes needed to hold `bit_count` bits.
    pub fn byte_len(bit_count: u64) -> usize {
        bit_count.div_ceil(8) as usize
    }

    /// A bitmap with every chunk pending.
    ///
    /// Padding bits in the final byte are left at 0.
    pub fn initialize(chunk_count: u64) -> Self {
        let mut bytes = vec![0xFF; Self::byte_len(chunk_count)];
        let used = (chunk_count % 8) as u32;
        if used != 0 {
            if let Some(last) = bytes.last_mut() {
                *last = 0xFFu8 << (8 - used);
            }
        }
        Self { bytes }
    }

    /// Wrap persisted bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Raw bytes, in persisted layout.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Total bit capacity (multiple of 8).
    pub fn capacity(&self) -> u64 {
        self.bytes.len() as u64 * 8
    }

    /// Read one bit.
    pub fn get_bit(&self, index: u64) -> Result<bool, BitmapError> {
        let (byte, mask) = self.locate(index)?;
        Ok(self.bytes[byte] & mask != 0)
    }

    /// Set (`true`) or clear (`false`) one bit.
    pub fn set_bit(&mut self, index: u64, value: bool) -> Result<(), BitmapError> {
        let (byte, mask) = self.locate(index)?;
        if value {
            self.bytes[byte] |= mask;
        } else {
            self.bytes[byte] &= !mask;
        }
        Ok(())
    }

    /// True iff every byte is zero, i.e. every chunk has been written.
    pub fn is_all_zero(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u64 {
        self.bytes.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Indexes of every bit equal to `value`, in ascending order.
    pub fn indexes_with_value(&self, value: bool) -> Vec<u64> {
        match self.capacity() {
            0 => Vec::new(),
            cap => self.indexes_with_value_in(value, 0, cap - 1),
        }
    }

    /// Indexes of bits equal to `value` within `min_index..=max_index`.
    ///
    /// Bytes that are entirely `0x00` or `0xFF` are decided without
    /// inspecting individual bits.
    pub fn indexes_with_value_in(&self, value: bool, min_index: u64, max_index: u64) -> Vec<u64> {
        let mut indexes = Vec::new();
        let capacity = self.capacity();
        if capacity == 0 || min_index > max_index || min_index >= capacity {
            return indexes;
        }
        let max_index = max_index.min(capacity - 1);

        let (skip, take) = if value { (0x00, 0xFF) } else { (0xFF, 0x00) };

        let first_byte = (min_index / 8) as usize;
        let last_byte = (max_index / 8) as usize;

        for (offset, &byte) in self.bytes[first_byte..=last_byte].iter().enumerate() {
            let base = (first_byte + offset) as u64 * 8;
            let lo = min_index.max(base);
            let hi = max_index.min(base + 7);

            if byte == skip {
                continue;
            }
            if byte == take {
                indexes.extend(lo..=hi);
                continue;
            }
            for index in lo..=hi {
                let bit = byte & (0x80 >> (index - base)) != 0;
                if bit == value {
                    indexes.push(index);
                }
            }
        }

        indexes
    }

    fn locate(&self, index: u64) -> Result<(usize, u8), BitmapError> {
        if index >= self.capacity() {
            return Err(BitmapError::IndexOutOfRange {
                index,
                capacity: self.capacity(),
            });
        }
        Ok(((index / 8) as usize, 0x80u8 >> (index % 8)))
    }
}

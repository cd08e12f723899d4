use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitVectorError {
    #[error("bit vector length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("bit index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("bits set beyond length {len}")]
    SpareBitsSet { len: usize },
}

/// Fixed-length bit set packed most-significant-bit first, as used by the
/// bitfield wire message. Bits past `len` in the last byte are always zero.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BitVector {
    len: usize,
    bytes: Vec<u8>,
}

impl BitVector {
    pub fn new(len: usize) -> Self {
        BitVector {
            len,
            bytes: vec![0; len.div_ceil(8)],
        }
    }

    pub fn full(len: usize) -> Self {
        let mut bits = BitVector {
            len,
            bytes: vec![0xff; len.div_ceil(8)],
        };
        bits.clear_spare_bits();
        bits
    }

    /// Unpacks `len` bits from their raw packed form. The byte count must be
    /// exactly `ceil(len / 8)` and no bit past `len` may be set.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self, BitVectorError> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(BitVectorError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let bits = BitVector {
            len,
            bytes: bytes.to_vec(),
        };
        if bits.spare_mask() & bits.bytes.last().copied().unwrap_or(0) != 0 {
            return Err(BitVectorError::SpareBitsSet { len });
        }
        Ok(bits)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns false for indexes outside the vector.
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bytes[index / 8] & (0b1000_0000 >> (index % 8)) != 0
    }

    pub fn set(&mut self, index: usize, value: bool) -> Result<(), BitVectorError> {
        self.check_index(index)?;
        let mask = 0b1000_0000 >> (index % 8);
        if value {
            self.bytes[index / 8] |= mask;
        } else {
            self.bytes[index / 8] &= !mask;
        }
        Ok(())
    }

    pub fn flip(&mut self, index: usize) -> Result<(), BitVectorError> {
        self.check_index(index)?;
        self.bytes[index / 8] ^= 0b1000_0000 >> (index % 8);
        Ok(())
    }

    pub fn cardinality(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn all(&self) -> bool {
        self.cardinality() == self.len
    }

    pub fn and(&self, other: &BitVector) -> Result<BitVector, BitVectorError> {
        self.zip_with(other, |a, b| a & b)
    }

    pub fn or(&self, other: &BitVector) -> Result<BitVector, BitVectorError> {
        self.zip_with(other, |a, b| a | b)
    }

    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|i| self.get(*i))
    }

    fn zip_with(
        &self,
        other: &BitVector,
        op: impl Fn(u8, u8) -> u8,
    ) -> Result<BitVector, BitVectorError> {
        if self.len != other.len {
            return Err(BitVectorError::LengthMismatch {
                expected: self.len,
                actual: other.len,
            });
        }
        Ok(BitVector {
            len: self.len,
            bytes: self
                .bytes
                .iter()
                .zip(other.bytes.iter())
                .map(|(a, b)| op(*a, *b))
                .collect(),
        })
    }

    fn check_index(&self, index: usize) -> Result<(), BitVectorError> {
        if index >= self.len {
            return Err(BitVectorError::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        Ok(())
    }

    // mask of the unused low bits of the last byte
    fn spare_mask(&self) -> u8 {
        match self.len % 8 {
            0 => 0,
            used => 0xff >> used,
        }
    }

    fn clear_spare_bits(&mut self) {
        let mask = self.spare_mask();
        if let Some(last) = self.bytes.last_mut() {
            *last &= !mask;
        }
    }
}

impl fmt::Display for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.cardinality(), self.len)
    }
}

/// Per-piece count of connected peers known to own that piece.
#[derive(Debug, Clone)]
pub struct RarityVector {
    counts: Vec<u32>,
}

impl RarityVector {
    pub fn new(len: usize) -> Self {
        RarityVector {
            counts: vec![0; len],
        }
    }

    pub fn get(&self, piece_idx: usize) -> u32 {
        self.counts.get(piece_idx).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, piece_idx: usize) {
        if let Some(c) = self.counts.get_mut(piece_idx) {
            *c += 1;
        }
    }

    pub fn add_bitfield(&mut self, bitfield: &BitVector) {
        for piece_idx in bitfield.ones() {
            self.increment(piece_idx);
        }
    }

    pub fn remove_bitfield(&mut self, bitfield: &BitVector) {
        for piece_idx in bitfield.ones() {
            if let Some(c) = self.counts.get_mut(piece_idx) {
                *c = c.saturating_sub(1);
            }
        }
    }
}

use anyhow::Result;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bitfield::BitVector;
use crate::metadata::metainfo::Metainfo;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("piece {0} is out of range")]
    OutOfRange(u32),
    #[error("piece {piece_idx} has {actual} bytes, expected {expected}")]
    Length {
        piece_idx: u32,
        expected: usize,
        actual: usize,
    },
    #[error("piece {0} does not match its hash")]
    Hash(u32),
}

/// Piece store shared by every connection of a torrent.
pub trait Storage: Send + Sync {
    fn has(&self, piece_idx: u32) -> bool;

    /// Content of a piece we own.
    fn piece(&self, piece_idx: u32) -> Result<Vec<u8>>;

    /// Zeroed buffer of the declared piece size.
    fn empty_piece(&self, piece_idx: u32) -> Vec<u8>;

    /// Ok(false) when the data does not validate, nothing is stored then.
    fn write_piece(&self, piece_idx: u32, data: &[u8]) -> Result<bool>;

    fn bitfield(&self) -> BitVector;
}

pub fn validate(metainfo: &Metainfo, piece_idx: u32, data: &[u8]) -> Result<(), ValidationError> {
    let Some(expected_hash) = metainfo.piece_hash(piece_idx) else {
        return Err(ValidationError::OutOfRange(piece_idx));
    };
    let expected = metainfo.piece_size(piece_idx);
    if data.len() != expected {
        return Err(ValidationError::Length {
            piece_idx,
            expected,
            actual: data.len(),
        });
    }
    if Sha1::digest(data).as_slice() != expected_hash {
        return Err(ValidationError::Hash(piece_idx));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::metainfo::tests::sample_metainfo;

    #[test]
    fn validates_size_and_hash() {
        let (metainfo, contents) = sample_metainfo(2, 100);
        assert_eq!(validate(&metainfo, 1, &contents[1]), Ok(()));
        assert_eq!(
            validate(&metainfo, 0, &contents[1]),
            Err(ValidationError::Hash(0))
        );
        assert_matches!(
            validate(&metainfo, 0, &contents[0][..99]),
            Err(ValidationError::Length {
                expected: 100,
                actual: 99,
                ..
            })
        );
        assert_eq!(
            validate(&metainfo, 2, &contents[0]),
            Err(ValidationError::OutOfRange(2))
        );
    }
}

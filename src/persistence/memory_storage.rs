use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use super::storage::{validate, Storage};
use crate::bitfield::BitVector;
use crate::metadata::metainfo::Metainfo;
use crate::util::lock;

pub struct MemoryStorage {
    metainfo: Arc<Metainfo>,
    pieces: Mutex<Vec<Option<Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new(metainfo: Arc<Metainfo>) -> Self {
        MemoryStorage {
            pieces: Mutex::new(vec![None; metainfo.number_of_pieces()]),
            metainfo,
        }
    }
}

impl Storage for MemoryStorage {
    fn has(&self, piece_idx: u32) -> bool {
        lock(&self.pieces)
            .get(piece_idx as usize)
            .is_some_and(|p| p.is_some())
    }

    fn piece(&self, piece_idx: u32) -> Result<Vec<u8>> {
        match lock(&self.pieces).get(piece_idx as usize) {
            Some(Some(p)) => Ok(p.clone()),
            _ => bail!("piece {piece_idx} is not available"),
        }
    }

    fn empty_piece(&self, piece_idx: u32) -> Vec<u8> {
        vec![0; self.metainfo.piece_size(piece_idx)]
    }

    fn write_piece(&self, piece_idx: u32, data: &[u8]) -> Result<bool> {
        if let Err(e) = validate(&self.metainfo, piece_idx, data) {
            log::warn!("{e}");
            return Ok(false);
        }
        lock(&self.pieces)[piece_idx as usize] = Some(data.to_vec());
        Ok(true)
    }

    fn bitfield(&self) -> BitVector {
        let pieces = lock(&self.pieces);
        let mut bitfield = BitVector::full(pieces.len());
        for (idx, piece) in pieces.iter().enumerate() {
            if piece.is_none() {
                // idx is in range by construction
                let _ = bitfield.set(idx, false);
            }
        }
        bitfield
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::metainfo::tests::sample_metainfo;

    #[test]
    fn stores_only_valid_pieces() {
        let (metainfo, contents) = sample_metainfo(3, 64);
        let storage = MemoryStorage::new(Arc::new(metainfo));
        assert_eq!(storage.empty_piece(1).len(), 64);
        assert!(storage.piece(1).is_err());

        assert!(!storage.write_piece(1, &contents[0]).unwrap());
        assert!(!storage.has(1));

        assert!(storage.write_piece(1, &contents[1]).unwrap());
        assert!(storage.has(1));
        assert_eq!(storage.piece(1).unwrap(), contents[1]);
        assert_eq!(storage.bitfield().ones().collect::<Vec<_>>(), vec![1]);
    }
}

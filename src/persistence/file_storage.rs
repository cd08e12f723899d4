use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use size::Size;

use super::storage::{validate, Storage};
use crate::bitfield::BitVector;
use crate::metadata::metainfo::Metainfo;
use crate::util::lock;

/// Stores the torrent content as one contiguous file named after the torrent.
pub struct FileStorage {
    metainfo: Arc<Metainfo>,
    path: PathBuf,
    file: Mutex<File>,
    completed: Mutex<BitVector>,
}

impl FileStorage {
    pub fn new(base_path: &Path, metainfo: Arc<Metainfo>) -> Result<Self> {
        let name = Path::new(metainfo.name());
        if name.is_absolute() || name.components().count() != 1 {
            bail!("refusing to store content under {:?}", metainfo.name());
        }
        fs::create_dir_all(base_path)
            .with_context(|| format!("could not create directory {}", base_path.display()))?;
        let path = base_path.join(name);
        if !metainfo.is_single_file() {
            log::warn!(
                "multi-file torrent: content will be stored as a single stream in {}, file boundaries:",
                path.display()
            );
            for f in metainfo.files() {
                log::warn!(
                    "  - {} at offset {} ({})",
                    f.path,
                    f.offset,
                    Size::from_bytes(f.length)
                );
            }
        }

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("could not open {}", path.display()))?;
        if file.metadata()?.len() < metainfo.length() {
            file.set_len(metainfo.length())?;
        }

        let storage = FileStorage {
            completed: Mutex::new(BitVector::new(metainfo.number_of_pieces())),
            metainfo,
            path,
            file: Mutex::new(file),
        };
        storage.refresh_completed_pieces();
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn refresh_completed_pieces(&self) {
        log::info!("checking pieces already downloaded...");
        let num_pieces = self.metainfo.number_of_pieces();
        let mut completed = BitVector::new(num_pieces);
        for idx in 0..num_pieces as u32 {
            if num_pieces >= 10 && idx as usize % (num_pieces / 10) == 0 {
                log::info!("{}%...", idx as usize * 100 / num_pieces);
            }
            match self.read_at(idx) {
                Ok(data) if validate(&self.metainfo, idx, &data).is_ok() => {
                    let _ = completed.set(idx as usize, true);
                }
                Ok(_) => {}
                Err(e) => log::debug!("could not read piece {idx}: {e}"),
            }
        }
        log::info!(
            "checking pieces already downloaded completed: {} out of {} pieces already completed",
            completed.cardinality(),
            num_pieces
        );
        *lock(&self.completed) = completed;
    }

    fn offset(&self, piece_idx: u32) -> u64 {
        piece_idx as u64 * self.metainfo.piece_length
    }

    fn read_at(&self, piece_idx: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.metainfo.piece_size(piece_idx)];
        let mut file = lock(&self.file);
        file.seek(SeekFrom::Start(self.offset(piece_idx)))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl Storage for FileStorage {
    fn has(&self, piece_idx: u32) -> bool {
        lock(&self.completed).get(piece_idx as usize)
    }

    fn piece(&self, piece_idx: u32) -> Result<Vec<u8>> {
        if !self.has(piece_idx) {
            bail!("requested to read piece idx {piece_idx} that we don't have");
        }
        self.read_at(piece_idx)
    }

    fn empty_piece(&self, piece_idx: u32) -> Vec<u8> {
        vec![0; self.metainfo.piece_size(piece_idx)]
    }

    fn write_piece(&self, piece_idx: u32, data: &[u8]) -> Result<bool> {
        if let Err(e) = validate(&self.metainfo, piece_idx, data) {
            log::warn!("{e}");
            return Ok(false);
        }
        if self.has(piece_idx) {
            log::debug!("we already have the piece {piece_idx}, will avoid to write it again");
            return Ok(true);
        }
        {
            let mut file = lock(&self.file);
            file.seek(SeekFrom::Start(self.offset(piece_idx)))?;
            file.write_all(data)?;
            file.flush()?;
        }
        lock(&self.completed).set(piece_idx as usize, true)?;
        Ok(true)
    }

    fn bitfield(&self) -> BitVector {
        lock(&self.completed).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::metainfo::tests::sample_metainfo;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("peerwire-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn writes_and_resumes() {
        let dir = temp_dir("resume");
        let (metainfo, contents) = sample_metainfo(4, 32);
        let metainfo = Arc::new(metainfo);

        let storage = FileStorage::new(&dir, metainfo.clone()).unwrap();
        assert_eq!(storage.bitfield().cardinality(), 0);
        assert!(storage.write_piece(2, &contents[2]).unwrap());
        assert!(!storage.write_piece(3, &contents[2]).unwrap());
        assert_eq!(storage.piece(2).unwrap(), contents[2]);
        assert!(storage.piece(3).is_err());
        assert_eq!(fs::metadata(storage.path()).unwrap().len(), 4 * 32);
        drop(storage);

        let resumed = FileStorage::new(&dir, metainfo).unwrap();
        assert_eq!(resumed.bitfield().ones().collect::<Vec<_>>(), vec![2]);
        let _ = fs::remove_dir_all(&dir);
    }
}

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use thiserror::Error;

use crate::bitfield::{BitVector, RarityVector};
use crate::manager::download_task::DownloadTask;
use crate::manager::peer::PeerAddr;
use crate::persistence::storage::Storage;
use crate::util::lock;

pub const MAX_TASKS: usize = 5; // pieces downloading at the same time
pub const RAREST_PIECES: usize = 5; // distinct rarity values scanned before picking at random

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapacityError {
    #[error("task limit reached ({0} active)")]
    Tasks(usize),
    #[error("peer limit reached ({0} connected)")]
    Peers(usize),
}

#[derive(Debug, PartialEq, Eq)]
pub enum PieceOutcome {
    Stored { download_complete: bool },
    Rejected,
}

// Lock order: wanted, tasks, rarity, rng. None of them is held while doing
// socket I/O.
pub struct PieceScheduler {
    storage: Arc<dyn Storage>,
    wanted: Mutex<BTreeSet<u32>>,
    tasks: Mutex<Vec<Arc<DownloadTask>>>,
    rarity: Mutex<RarityVector>,
    rng: Mutex<StdRng>,
}

impl PieceScheduler {
    pub fn new(storage: Arc<dyn Storage>, rng: StdRng) -> Self {
        let owned = storage.bitfield();
        let wanted = (0..owned.len())
            .filter(|i| !owned.get(*i))
            .map(|i| i as u32)
            .collect();
        PieceScheduler {
            rarity: Mutex::new(RarityVector::new(owned.len())),
            storage,
            wanted: Mutex::new(wanted),
            tasks: Mutex::new(Vec::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Picks work for a peer: a stale task the peer can help with first,
    /// otherwise a new task for one of the rarest wanted pieces it has.
    pub fn next_piece(&self, peer_addr: &PeerAddr, haves: &BitVector) -> Option<Arc<DownloadTask>> {
        let mut wanted = lock(&self.wanted);
        let mut tasks = lock(&self.tasks);

        let now = Instant::now();
        if let Some(task) = tasks.iter().find(|t| {
            haves.get(t.piece_idx() as usize) && !t.has_peer(peer_addr) && t.is_stale(now)
        }) {
            task.add_peer(peer_addr);
            log::debug!("peer {peer_addr} joins stale {task}");
            return Some(task.clone());
        }

        if tasks.len() >= MAX_TASKS {
            log::trace!("no new task for {peer_addr}: {}", CapacityError::Tasks(tasks.len()));
            return None;
        }

        let candidates = self.rarest_candidates_locked(&wanted, haves);
        let piece_idx = *candidates.choose(&mut *lock(&self.rng))?;
        wanted.remove(&piece_idx);

        let task = Arc::new(DownloadTask::new(
            piece_idx,
            self.storage.empty_piece(piece_idx),
        ));
        task.add_peer(peer_addr);
        tasks.push(task.clone());
        log::debug!(
            "new task for piece {piece_idx} with peer {peer_addr} (picked among {} candidates)",
            candidates.len()
        );
        Some(task)
    }

    /// Wanted pieces the peer has, rarest first, cut after `RAREST_PIECES`
    /// distinct rarity values.
    pub fn rarest_candidates(&self, haves: &BitVector) -> Vec<u32> {
        let wanted = lock(&self.wanted);
        self.rarest_candidates_locked(&wanted, haves)
    }

    fn rarest_candidates_locked(&self, wanted: &BTreeSet<u32>, haves: &BitVector) -> Vec<u32> {
        let rarity = lock(&self.rarity);
        let mut pieces: Vec<u32> = wanted
            .iter()
            .filter(|i| haves.get(**i as usize))
            .copied()
            .collect();
        pieces.sort_by_key(|i| rarity.get(*i as usize));

        let mut distinct = 0;
        let mut last = None;
        let mut scanned = 0;
        for piece_idx in &pieces {
            let r = rarity.get(*piece_idx as usize);
            if last != Some(r) {
                if distinct == RAREST_PIECES {
                    break;
                }
                distinct += 1;
                last = Some(r);
            }
            scanned += 1;
        }
        pieces.truncate(scanned);
        pieces
    }

    /// True when the peer owns a piece we want or are downloading.
    pub fn is_interesting(&self, haves: &BitVector) -> bool {
        let wanted = lock(&self.wanted);
        if wanted.iter().any(|i| haves.get(*i as usize)) {
            return true;
        }
        let tasks = lock(&self.tasks);
        tasks
            .iter()
            .any(|t| !t.is_done() && haves.get(t.piece_idx() as usize))
    }

    pub fn peer_has(&self, piece_idx: u32) {
        lock(&self.rarity).increment(piece_idx as usize);
    }

    pub fn peer_bitfield(&self, haves: &BitVector) {
        lock(&self.rarity).add_bitfield(haves);
    }

    pub fn remove_peer(&self, peer_addr: &PeerAddr, haves: Option<&BitVector>) {
        for task in lock(&self.tasks).iter() {
            task.remove_peer(peer_addr);
        }
        if let Some(haves) = haves {
            lock(&self.rarity).remove_bitfield(haves);
        }
    }

    /// Hands an assembled piece to storage. A piece that fails validation or
    /// cannot be written goes back to the wanted set.
    pub fn piece_completed(&self, piece_idx: u32, buffer: &[u8]) -> PieceOutcome {
        let stored = match self.storage.write_piece(piece_idx, buffer) {
            Ok(valid) => valid,
            Err(e) => {
                log::error!("could not store piece {piece_idx}: {e:#}");
                false
            }
        };

        let mut wanted = lock(&self.wanted);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| t.piece_idx() != piece_idx);
        if !stored {
            wanted.insert(piece_idx);
            return PieceOutcome::Rejected;
        }
        PieceOutcome::Stored {
            download_complete: wanted.is_empty() && tasks.is_empty(),
        }
    }

    pub fn is_complete(&self) -> bool {
        let wanted = lock(&self.wanted);
        let tasks = lock(&self.tasks);
        wanted.is_empty() && tasks.is_empty()
    }

    pub fn wanted_count(&self) -> usize {
        lock(&self.wanted).len()
    }

    pub fn active_tasks(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn rarity(&self, piece_idx: u32) -> u32 {
        lock(&self.rarity).get(piece_idx as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::SeedableRng;

    use super::*;
    use crate::manager::download_task::BlockOutcome;
    use crate::metadata::metainfo::tests::sample_metainfo;
    use crate::persistence::memory_storage::MemoryStorage;

    fn scheduler(num_pieces: usize, seed: u64) -> (PieceScheduler, Vec<Vec<u8>>) {
        let (metainfo, contents) = sample_metainfo(num_pieces, 16384);
        let storage = Arc::new(MemoryStorage::new(Arc::new(metainfo)));
        (
            PieceScheduler::new(storage, StdRng::seed_from_u64(seed)),
            contents,
        )
    }

    fn bits(len: usize, ones: &[usize]) -> BitVector {
        let mut b = BitVector::new(len);
        for i in ones {
            b.set(*i, true).unwrap();
        }
        b
    }

    #[test]
    fn candidates_cover_five_rarest_values() {
        let (scheduler, _) = scheduler(10, 1);
        // piece i is owned by i other peers
        for i in 0..10u32 {
            for _ in 0..i {
                scheduler.peer_has(i);
            }
        }
        let all = bits(10, &(0..10).collect::<Vec<_>>());
        assert_eq!(scheduler.rarest_candidates(&all), vec![0, 1, 2, 3, 4]);

        let some = bits(10, &[9, 2, 7]);
        assert_eq!(scheduler.rarest_candidates(&some), vec![2, 7, 9]);
    }

    #[test]
    fn candidates_include_every_piece_sharing_a_rarity() {
        let (scheduler, _) = scheduler(10, 1);
        scheduler.peer_bitfield(&bits(10, &[8, 9]));
        let all = bits(10, &(0..10).collect::<Vec<_>>());
        let candidates = scheduler.rarest_candidates(&all);
        assert_eq!(candidates.len(), 10);
        assert_eq!(&candidates[8..], &[8, 9]);
    }

    #[test]
    fn selection_is_deterministic_for_a_seed() {
        let picks = |seed| {
            let (scheduler, _) = scheduler(20, seed);
            let haves = bits(20, &(0..20).collect::<Vec<_>>());
            (0..MAX_TASKS)
                .map(|n| {
                    scheduler
                        .next_piece(&format!("peer{n}"), &haves)
                        .unwrap()
                        .piece_idx()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(7), picks(7));
    }

    #[test]
    fn next_piece_limits_tasks_and_claims_pieces() {
        let (scheduler, _) = scheduler(10, 3);
        let haves = bits(10, &(0..10).collect::<Vec<_>>());
        let mut seen = HashSet::new();
        for n in 0..MAX_TASKS {
            let peer = format!("peer{n}");
            let task = scheduler.next_piece(&peer, &haves).unwrap();
            assert!(seen.insert(task.piece_idx()));
            assert!(task.has_peer(&peer));
        }
        assert_eq!(scheduler.wanted_count(), 10 - MAX_TASKS);
        assert!(scheduler.next_piece(&"late".to_string(), &haves).is_none());
    }

    #[test]
    fn peer_without_wanted_pieces_gets_nothing() {
        let (scheduler, _) = scheduler(4, 3);
        assert!(scheduler.next_piece(&"p".to_string(), &bits(4, &[])).is_none());
        assert!(!scheduler.is_interesting(&bits(4, &[])));
        assert!(scheduler.is_interesting(&bits(4, &[3])));
    }

    #[test]
    fn stale_task_is_shared() {
        let (scheduler, _) = scheduler(3, 3);
        let first: PeerAddr = "a".to_string();
        let second: PeerAddr = "b".to_string();
        let haves = bits(3, &[1]);
        let task = scheduler.next_piece(&first, &haves).unwrap();
        assert_eq!(task.piece_idx(), 1);
        // task has a peer and fresh progress: no piece left for the second peer
        assert!(scheduler.next_piece(&second, &haves).is_none());
        // once the first peer leaves the task is stale and can be joined
        scheduler.remove_peer(&first, Some(&haves));
        let joined = scheduler.next_piece(&second, &haves).unwrap();
        assert!(Arc::ptr_eq(&task, &joined));
        assert!(joined.has_peer(&second));
    }

    #[test]
    fn rarity_follows_connected_peers() {
        let (scheduler, _) = scheduler(5, 3);
        let a = bits(5, &[3]);
        let mut b = bits(5, &[]);
        scheduler.peer_bitfield(&a);
        b.set(3, true).unwrap();
        scheduler.peer_has(3);
        assert_eq!(scheduler.rarity(3), 2);
        scheduler.remove_peer(&"a".to_string(), Some(&a));
        assert_eq!(scheduler.rarity(3), 1);
        scheduler.remove_peer(&"b".to_string(), Some(&b));
        assert_eq!(scheduler.rarity(3), 0);
    }

    #[test]
    fn valid_piece_is_stored_and_invalid_piece_is_wanted_again() {
        let (scheduler, contents) = scheduler(2, 3);
        let haves = bits(2, &[0, 1]);
        let peer: PeerAddr = "p".to_string();

        let task = scheduler.next_piece(&peer, &haves).unwrap();
        let idx = task.piece_idx();
        assert_eq!(
            scheduler.piece_completed(idx, &vec![0xaa; 16384]),
            PieceOutcome::Rejected
        );
        assert_eq!(scheduler.wanted_count(), 2);
        assert_eq!(scheduler.active_tasks(), 0);

        for _ in 0..2 {
            let task = scheduler.next_piece(&peer, &haves).unwrap();
            let idx = task.piece_idx();
            let outcome = task.block_received(0, &contents[idx as usize]);
            let BlockOutcome::Completed(buffer) = outcome else {
                panic!("piece should be complete");
            };
            let result = scheduler.piece_completed(idx, &buffer);
            assert_matches!(result, PieceOutcome::Stored { .. });
        }
        assert!(scheduler.is_complete());
    }
}

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::manager::peer::PeerAddr;
use crate::torrent_protocol::wire_protocol::BlockRequest;
use crate::util::lock;

pub const BLOCK_LENGTH: u32 = 16384; // 2^14, the de facto block size
pub const STALE: Duration = Duration::from_secs(120); // no block in this time: other peers may join the task

#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    Stored,
    Completed(Vec<u8>),
    Ignored, // not pending: already received from another peer, or wrong size
}

#[derive(Debug)]
struct Blocks {
    buffer: Vec<u8>,
    pending: Vec<BlockRequest>,
    last_progress: Instant,
}

/// Reconstruction of a single piece. Lock order: `blocks` then `peers`.
#[derive(Debug)]
pub struct DownloadTask {
    piece_idx: u32,
    length: usize,
    blocks: Mutex<Blocks>,
    peers: Mutex<Vec<PeerAddr>>,
}

impl DownloadTask {
    pub fn new(piece_idx: u32, buffer: Vec<u8>) -> Self {
        let length = buffer.len();
        let pending = (0..length)
            .step_by(BLOCK_LENGTH as usize)
            .map(|begin| BlockRequest {
                piece_idx,
                block_begin: begin as u32,
                data_len: (length - begin).min(BLOCK_LENGTH as usize) as u32,
            })
            .collect();
        DownloadTask {
            piece_idx,
            length,
            blocks: Mutex::new(Blocks {
                buffer,
                pending,
                last_progress: Instant::now(),
            }),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn piece_idx(&self) -> u32 {
        self.piece_idx
    }

    /// Up to `count` pending requests that are not in `exclude`.
    pub fn requests(&self, count: usize, exclude: &[BlockRequest]) -> Vec<BlockRequest> {
        lock(&self.blocks)
            .pending
            .iter()
            .filter(|r| !exclude.contains(r))
            .take(count)
            .copied()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.blocks).pending.len()
    }

    /// Stores a block. The assembled piece is handed out exactly once, with
    /// the block that completes it.
    pub fn block_received(&self, begin: u32, data: &[u8]) -> BlockOutcome {
        let mut blocks = lock(&self.blocks);
        let Some(pos) = blocks
            .pending
            .iter()
            .position(|r| r.block_begin == begin && r.data_len as usize == data.len())
        else {
            log::trace!(
                "piece {}: ignoring block at {begin} ({} bytes), not pending",
                self.piece_idx,
                data.len()
            );
            return BlockOutcome::Ignored;
        };
        blocks.pending.remove(pos);
        let begin = begin as usize;
        blocks.buffer[begin..begin + data.len()].copy_from_slice(data);
        blocks.last_progress = Instant::now();
        if !blocks.pending.is_empty() {
            return BlockOutcome::Stored;
        }
        lock(&self.peers).clear();
        BlockOutcome::Completed(std::mem::take(&mut blocks.buffer))
    }

    pub fn is_done(&self) -> bool {
        lock(&self.blocks).pending.is_empty()
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        let blocks = lock(&self.blocks);
        if blocks.pending.is_empty() {
            return false;
        }
        let idle = now.saturating_duration_since(blocks.last_progress);
        lock(&self.peers).is_empty() || idle > STALE
    }

    pub fn add_peer(&self, peer_addr: &PeerAddr) {
        let _blocks = lock(&self.blocks);
        let mut peers = lock(&self.peers);
        if !peers.contains(peer_addr) {
            peers.push(peer_addr.clone());
        }
    }

    pub fn remove_peer(&self, peer_addr: &PeerAddr) {
        let _blocks = lock(&self.blocks);
        lock(&self.peers).retain(|p| p != peer_addr);
    }

    pub fn has_peer(&self, peer_addr: &PeerAddr) -> bool {
        let _blocks = lock(&self.blocks);
        lock(&self.peers).contains(peer_addr)
    }

    pub fn peer_count(&self) -> usize {
        let _blocks = lock(&self.blocks);
        lock(&self.peers).len()
    }
}

impl fmt::Display for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "task for piece {} of {} bytes ({} blocks pending, {} peers)",
            self.piece_idx,
            self.length,
            self.pending_count(),
            self.peer_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_piece_into_blocks() {
        let task = DownloadTask::new(3, vec![0; 40000]);
        let requests = task.requests(10, &[]);
        assert_eq!(requests.len(), 3);
        assert_eq!(
            requests.iter().map(|r| r.data_len).collect::<Vec<_>>(),
            vec![16384, 16384, 40000 - 2 * 16384]
        );
        assert!(requests.iter().all(|r| r.piece_idx == 3));

        let even = DownloadTask::new(0, vec![0; 2 * 16384]);
        let requests = even.requests(10, &[]);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].data_len, 16384);
    }

    #[test]
    fn requests_skip_excluded() {
        let task = DownloadTask::new(0, vec![0; 5 * 16384]);
        let first = task.requests(2, &[]);
        let next = task.requests(2, &first);
        assert_eq!(next[0].block_begin, 2 * 16384);
        assert_eq!(task.requests(10, &first).len(), 3);
    }

    #[test]
    fn completes_once_every_block_matches() {
        let task = DownloadTask::new(1, vec![0; 16384 + 10]);
        assert_eq!(task.block_received(16384, &[1; 9]), BlockOutcome::Ignored);
        assert_eq!(task.block_received(16384, &[1; 10]), BlockOutcome::Stored);
        assert!(!task.is_done());
        assert_eq!(task.block_received(16384, &[1; 10]), BlockOutcome::Ignored);
        let outcome = task.block_received(0, &[2; 16384]);
        assert_matches!(outcome, BlockOutcome::Completed(buffer) => {
            assert_eq!(buffer.len(), 16384 + 10);
            assert_eq!(buffer[0], 2);
            assert_eq!(buffer[16384], 1);
        });
        assert!(task.is_done());
        assert_eq!(task.block_received(0, &[2; 16384]), BlockOutcome::Ignored);
    }

    #[test]
    fn staleness() {
        let task = DownloadTask::new(0, vec![0; 100]);
        let peer: PeerAddr = "10.0.0.1:6881".to_string();
        let now = Instant::now();
        assert!(task.is_stale(now));
        task.add_peer(&peer);
        task.add_peer(&peer);
        assert_eq!(task.peer_count(), 1);
        assert!(!task.is_stale(now));
        assert!(task.is_stale(now + STALE + Duration::from_secs(1)));
        task.remove_peer(&peer);
        assert!(task.is_stale(now));

        task.add_peer(&peer);
        task.block_received(0, &[0; 100]);
        assert!(task.is_done());
        assert!(!task.is_stale(now + STALE * 2));
        assert!(!task.has_peer(&peer));
    }
}

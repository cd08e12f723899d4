use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;

use crate::manager::peer::PeerAddr;
use crate::manager::peer_connection::PeerStats;
use crate::util::lock;

pub const UNCHOKE_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_DOWNLOADERS: usize = 4; // unchoked by rank
pub const MAX_OPTIMISTIC_UNCHOKES: usize = 3;
const OPTIMISTIC_ROUNDS: u64 = 3; // a new optimistic set is drawn every this many rounds
const MARK_ROUNDS: u64 = 2; // rate counters are reset every this many rounds

#[derive(Debug, Default, PartialEq)]
pub struct ChokeDecision {
    pub unchoke: Vec<PeerAddr>,
    pub choke: Vec<PeerAddr>,
    pub mark: bool,
}

struct ChokeState {
    round: u64,
    optimistic_unchokes: usize,
    downloaders: Vec<PeerAddr>,
    optimistic: Vec<PeerAddr>,
    seeding: bool,
    rng: StdRng,
}

/// Reciprocation ranking. Pure bookkeeping: it decides, the manager applies
/// the decision to the connections.
pub struct ChokeController {
    state: Mutex<ChokeState>,
}

impl ChokeController {
    pub fn new(seeding: bool, rng: StdRng) -> Self {
        ChokeController {
            state: Mutex::new(ChokeState {
                round: 0,
                optimistic_unchokes: 1,
                downloaders: Vec::new(),
                optimistic: Vec::new(),
                seeding,
                rng,
            }),
        }
    }

    pub fn round(&self, peers: &[(PeerAddr, PeerStats)]) -> ChokeDecision {
        let mut state = lock(&self.state);
        let round = state.round;
        state.round += 1;

        let seeding = state.seeding;
        let metric = |stats: &PeerStats| {
            if seeding {
                stats.upload_rate
            } else {
                stats.download_rate
            }
        };
        let mut interested: Vec<&(PeerAddr, PeerStats)> =
            peers.iter().filter(|(_, s)| s.interested).collect();
        interested.sort_by(|a, b| metric(&b.1).total_cmp(&metric(&a.1)));
        let downloaders: Vec<PeerAddr> = interested
            .iter()
            .take(MAX_DOWNLOADERS)
            .map(|(addr, _)| addr.clone())
            .collect();

        let count = state.optimistic_unchokes;
        let ChokeState {
            rng, optimistic, ..
        } = &mut *state;
        if round % OPTIMISTIC_ROUNDS == 0 {
            let candidates: Vec<&PeerAddr> = interested
                .iter()
                .map(|(addr, _)| addr)
                .filter(|addr| !downloaders.contains(addr))
                .collect();
            *optimistic = candidates
                .choose_multiple(rng, count)
                .map(|addr| (*addr).clone())
                .collect();
            if !optimistic.is_empty() {
                log::debug!("optimistic unchoke: {optimistic:?}");
            }
        } else {
            optimistic.retain(|addr| peers.iter().any(|(p, _)| p == addr));
        }

        let unchoked = |addr: &PeerAddr| downloaders.contains(addr) || optimistic.contains(addr);
        let decision = ChokeDecision {
            unchoke: peers
                .iter()
                .filter(|(addr, s)| s.choking && unchoked(addr))
                .map(|(addr, _)| addr.clone())
                .collect(),
            choke: peers
                .iter()
                .filter(|(addr, s)| !s.choking && !unchoked(addr))
                .map(|(addr, _)| addr.clone())
                .collect(),
            mark: round % MARK_ROUNDS == 0,
        };

        if !seeding {
            let mut unchoking_us = peers.iter().filter(|(_, s)| !s.choked).peekable();
            if unchoking_us.peek().is_some() && unchoking_us.all(|(_, s)| s.snubbing) {
                log::debug!("every peer unchoking us is snubbing us");
                snubbed(&mut state);
            }
        }
        state.downloaders = downloaders;
        decision
    }

    /// A peer became interested: it is unchoked right away when a downloader
    /// slot is free.
    pub fn interested(&self, peer_addr: &PeerAddr) -> bool {
        let mut state = lock(&self.state);
        if state.downloaders.contains(peer_addr) || state.optimistic.contains(peer_addr) {
            return true;
        }
        if state.downloaders.len() < MAX_DOWNLOADERS {
            state.downloaders.push(peer_addr.clone());
            return true;
        }
        false
    }

    pub fn optimistic_unchokes(&self) -> usize {
        lock(&self.state).optimistic_unchokes
    }

    pub fn set_seeding(&self, seeding: bool) {
        lock(&self.state).seeding = seeding;
    }

    pub fn is_seeding(&self) -> bool {
        lock(&self.state).seeding
    }

    pub fn remove_peer(&self, peer_addr: &PeerAddr) {
        let mut state = lock(&self.state);
        state.downloaders.retain(|p| p != peer_addr);
        state.optimistic.retain(|p| p != peer_addr);
    }
}

fn snubbed(state: &mut ChokeState) {
    state.optimistic_unchokes = (state.optimistic_unchokes + 1).min(MAX_OPTIMISTIC_UNCHOKES);
}

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use rand::rngs::StdRng;
use rand::SeedableRng;
use size::{Size, Style};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::manager::bandwidth_tracker::BandwidthTracker;
use crate::manager::choke_controller::{ChokeController, UNCHOKE_INTERVAL};
use crate::manager::peer::{self, PeerAddr};
use crate::manager::peer_connection::{PeerChannels, PeerConnection, PeerStats};
use crate::manager::piece_scheduler::{CapacityError, PieceOutcome, PieceScheduler};
use crate::metadata::metainfo::Metainfo;
use crate::persistence::storage::Storage;
use crate::torrent_protocol::wire_protocol::Message;
use crate::tracker::{self, TrackerClient, TransferStats};
use crate::util::{force_string, lock, pretty_info_hash};
use crate::worker::DeferredWorker;

pub const MAX_PEERS: usize = 30;
pub const DELTA_PEERS: usize = 5; // ask for more peers when this many slots are free
const MAX_CANDIDATES: usize = 200; // addresses from trackers waiting for a free slot

/// Everything about one torrent: connections, piece scheduling, choking and
/// the tracker feed.
pub struct TorrentManager {
    me: Weak<TorrentManager>,
    metainfo: Arc<Metainfo>,
    storage: Arc<dyn Storage>,
    scheduler: PieceScheduler,
    choke_controller: ChokeController,
    peers: Mutex<HashMap<PeerAddr, Arc<PeerConnection>>>,
    connecting: Mutex<HashSet<SocketAddr>>,
    candidates: Mutex<VecDeque<SocketAddr>>,
    stats: Arc<TransferStats>,
    bandwidth: Mutex<BandwidthTracker>,
    worker: DeferredWorker,
    peer_id: [u8; 20],
    halt_tx: watch::Sender<bool>,
    tracker_wakeup: Notify,
}

impl TorrentManager {
    pub fn new(
        metainfo: Arc<Metainfo>,
        storage: Arc<dyn Storage>,
        peer_id: [u8; 20],
        worker: DeferredWorker,
        mut rng: StdRng,
    ) -> Arc<Self> {
        let owned = storage.bitfield();
        let left = (0..metainfo.number_of_pieces() as u32)
            .filter(|i| !owned.get(*i as usize))
            .map(|i| metainfo.piece_size(i) as u64)
            .sum();
        let scheduler = PieceScheduler::new(storage.clone(), StdRng::from_rng(&mut rng));
        let choke_controller = ChokeController::new(owned.all(), rng);
        let (halt_tx, _) = watch::channel(false);
        Arc::new_cyclic(|me| TorrentManager {
            me: me.clone(),
            metainfo,
            storage,
            scheduler,
            choke_controller,
            peers: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            candidates: Mutex::new(VecDeque::new()),
            stats: Arc::new(TransferStats::new(left)),
            bandwidth: Mutex::new(BandwidthTracker::new()),
            worker,
            peer_id,
            halt_tx,
            tracker_wakeup: Notify::new(),
        })
    }

    /// Spawns the choke controller and the tracker announce loop.
    pub fn start(self: &Arc<Self>, tracker: TrackerClient) -> Vec<JoinHandle<()>> {
        log::info!(
            "starting torrent {} ({}), we own {} pieces",
            self.metainfo.name(),
            pretty_info_hash(self.info_hash()),
            self.storage.bitfield()
        );
        vec![
            tokio::spawn(self.clone().run_choke_controller(self.halt_tx.subscribe())),
            tokio::spawn(tracker::run_announce_loop(
                self.clone(),
                tracker,
                self.halt_tx.subscribe(),
            )),
        ]
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.metainfo.info_hash()
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn scheduler(&self) -> &PieceScheduler {
        &self.scheduler
    }

    pub fn choke_controller(&self) -> &ChokeController {
        &self.choke_controller
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }

    pub fn tracker_wakeup(&self) -> &Notify {
        &self.tracker_wakeup
    }

    pub fn is_complete(&self) -> bool {
        self.scheduler.is_complete()
    }

    pub fn is_halted(&self) -> bool {
        *self.halt_tx.borrow()
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.peers).len()
    }

    fn connections(&self) -> Vec<Arc<PeerConnection>> {
        lock(&self.peers).values().cloned().collect()
    }

    /// True while there is room for another connection.
    pub fn need_more(&self) -> bool {
        if self.is_halted() {
            return false;
        }
        let peers = lock(&self.peers).len();
        peers + lock(&self.connecting).len() < MAX_PEERS
    }

    /// New candidate addresses from a tracker.
    pub fn tracker_responded(&self, addrs: Vec<SocketAddr>) {
        {
            let mut candidates = lock(&self.candidates);
            for addr in addrs {
                if !candidates.contains(&addr) {
                    candidates.push_back(addr);
                }
            }
            while candidates.len() > MAX_CANDIDATES {
                candidates.pop_front();
            }
        }
        self.connect_more();
    }

    fn connect_more(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        while self.need_more() {
            let Some(addr) = lock(&self.candidates).pop_front() else {
                break;
            };
            if lock(&self.peers).contains_key(&addr.to_string()) {
                continue;
            }
            if !lock(&self.connecting).insert(addr) {
                continue;
            }
            tokio::spawn(peer::connect_to_new_peer(me.clone(), addr));
        }
    }

    pub fn connect_finished(&self, addr: &SocketAddr) {
        lock(&self.connecting).remove(addr);
    }

    /// Admits a handshaken connection and starts its reader and writer.
    pub fn add_peer<S>(
        self: &Arc<Self>,
        peer_addr: PeerAddr,
        peer_id: [u8; 20],
        stream: S,
    ) -> Result<Arc<PeerConnection>, CapacityError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (connection, channels) = self.register_peer(peer_addr, peer_id)?;
        peer::start_peer_msg_handlers(self.clone(), connection.clone(), stream, channels);
        Ok(connection)
    }

    fn register_peer(
        &self,
        peer_addr: PeerAddr,
        peer_id: [u8; 20],
    ) -> Result<(Arc<PeerConnection>, PeerChannels), CapacityError> {
        let mut peers = lock(&self.peers);
        if self.is_halted() || peers.len() >= MAX_PEERS || peers.contains_key(&peer_addr) {
            return Err(CapacityError::Peers(peers.len()));
        }
        let (connection, channels) =
            PeerConnection::new(peer_addr.clone(), peer_id, self.metainfo.number_of_pieces());
        let owned = self.storage.bitfield();
        if owned.cardinality() > 0 {
            connection.try_send(Message::Bitfield(owned));
        }
        peers.insert(peer_addr.clone(), connection.clone());
        log::debug!(
            "new peer {peer_addr} ({}), {} connected",
            force_string(&peer_id),
            peers.len()
        );
        Ok((connection, channels))
    }

    /// Releases a connection from every task and from the rarity counts.
    /// Removing an unknown peer is a no-op.
    pub fn remove_peer(&self, peer_addr: &PeerAddr) {
        let Some(connection) = lock(&self.peers).remove(peer_addr) else {
            return;
        };
        connection.close();
        self.scheduler
            .remove_peer(peer_addr, connection.haves().as_ref());
        self.choke_controller.remove_peer(peer_addr);
        log::debug!("peer {peer_addr} removed, {} connected", self.peer_count());

        if !self.is_halted() && self.peer_count() < MAX_PEERS - DELTA_PEERS {
            self.connect_more();
            if lock(&self.candidates).is_empty() {
                self.tracker_wakeup.notify_one();
            }
        }
    }

    /// Hands an assembled piece to the deferred worker for validation.
    pub fn got_piece(&self, piece_idx: u32, buffer: Vec<u8>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.worker
            .now(async move { me.finalize_piece(piece_idx, buffer).await });
    }

    async fn finalize_piece(&self, piece_idx: u32, buffer: Vec<u8>) {
        let outcome = self.scheduler.piece_completed(piece_idx, &buffer);
        let connections = self.connections();
        let mut download_complete = false;
        match outcome {
            PieceOutcome::Rejected => {
                log::warn!("piece {piece_idx} failed validation, it will be downloaded again");
            }
            PieceOutcome::Stored {
                download_complete: complete,
            } => {
                let len = buffer.len() as u64;
                self.stats.update_downloaded(len);
                self.stats.update_left(len);
                log::info!(
                    "piece {piece_idx} completed, we own {} pieces",
                    self.storage.bitfield()
                );
                for connection in &connections {
                    connection.send(Message::Have(piece_idx)).await;
                }
                download_complete = complete;
            }
        }
        // the wanted set changed either way
        for connection in &connections {
            connection.refresh_interest(&self.scheduler).await;
        }
        if download_complete {
            log::info!("download of {} completed", self.metainfo.name());
            self.choke_controller.set_seeding(true);
            self.tracker_wakeup.notify_one();
        }
    }

    pub async fn peer_interested(&self, peer_addr: &PeerAddr) {
        if !self.choke_controller.interested(peer_addr) {
            return;
        }
        let connection = lock(&self.peers).get(peer_addr).cloned();
        if let Some(connection) = connection {
            connection.set_choking(false).await;
        }
    }

    pub fn block_uploaded(&self, len: usize) {
        self.stats.update_uploaded(len as u64);
        lock(&self.bandwidth).add_uploaded_bytes(len as u64);
    }

    pub fn block_downloaded(&self, len: usize) {
        lock(&self.bandwidth).add_downloaded_bytes(len as u64);
    }

    async fn run_choke_controller(self: Arc<Self>, mut halt: watch::Receiver<bool>) {
        let mut ticker = interval(UNCHOKE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = halt.changed() => break,
                _ = ticker.tick() => {}
            }
            self.choke_round().await;
            self.log_status();
        }
        log::debug!("choke controller stopped");
    }

    pub async fn choke_round(&self) {
        let connections = self.connections();
        let snapshot: Vec<(PeerAddr, PeerStats)> = connections
            .iter()
            .map(|c| (c.peer_addr().clone(), c.stats()))
            .collect();
        let decision = self.choke_controller.round(&snapshot);
        for connection in &connections {
            if decision.unchoke.contains(connection.peer_addr()) {
                connection.set_choking(false).await;
            } else if decision.choke.contains(connection.peer_addr()) {
                connection.set_choking(true).await;
            }
            if decision.mark {
                connection.mark();
            }
        }
        if decision.mark {
            lock(&self.bandwidth).mark();
        }
    }

    fn log_status(&self) {
        log::info!(
            "pieces: {}, peers: {}, active tasks: {}, left: {}, {}",
            self.storage.bitfield(),
            self.peer_count(),
            self.scheduler.active_tasks(),
            Size::from_bytes(self.stats.left())
                .format()
                .with_style(Style::Abbreviated),
            lock(&self.bandwidth)
        );
    }

    /// Closes every connection and stops the choke and tracker loops.
    pub fn halt(&self) {
        if self.halt_tx.send_replace(true) {
            return;
        }
        let addrs: Vec<PeerAddr> = lock(&self.peers).keys().cloned().collect();
        for addr in &addrs {
            self.remove_peer(addr);
        }
        log::info!(
            "torrent {} halted, {} connections closed",
            self.metainfo.name(),
            addrs.len()
        );
    }
}

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::bitfield::BitVector;
use crate::manager::bandwidth_tracker::BandwidthTracker;
use crate::manager::download_task::{BlockOutcome, DownloadTask};
use crate::manager::peer::{PeerAddr, ToPeerMsg};
use crate::manager::piece_scheduler::PieceScheduler;
use crate::manager::torrent_manager::TorrentManager;
use crate::torrent_protocol::wire_protocol::{BlockRequest, Message, ProtocolError};
use crate::util::{force_string, lock};

pub const REQUEST_WINDOW: usize = 10; // outstanding block requests per connection
pub const SNUB_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REQUEST_LENGTH: u32 = 1 << 17; // larger requests are dropped
const TO_PEER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Established => "established",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Snapshot used by the choke controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStats {
    pub interested: bool, // the peer wants our pieces
    pub choking: bool,    // we refuse to upload to the peer
    pub choked: bool,     // the peer refuses to upload to us
    pub download_rate: f64,
    pub upload_rate: f64,
    pub snubbing: bool,
}

#[derive(Debug)]
struct PeerState {
    status: ConnectionState,
    haves: Option<BitVector>,
    choked: bool,
    choking: bool,
    interested: bool,
    interesting: bool,
    outstanding: Vec<BlockRequest>,
    tasks: Vec<Arc<DownloadTask>>,
    queued_replies: HashMap<BlockRequest, usize>, // piece replies not yet written
    bandwidth: BandwidthTracker,
    last_block: Instant,
}

/// Receiving ends handed to the reader and writer tasks of a connection.
#[derive(Debug)]
pub struct PeerChannels {
    pub to_peer_rx: mpsc::Receiver<ToPeerMsg>,
    pub halt_rx: watch::Receiver<bool>,
}

/// State of an established connection. Socket I/O happens in the reader and
/// writer tasks; this type only queues outbound messages.
#[derive(Debug)]
pub struct PeerConnection {
    peer_addr: PeerAddr,
    peer_id: [u8; 20],
    num_pieces: usize,
    state: Mutex<PeerState>,
    to_peer_tx: mpsc::Sender<ToPeerMsg>,
    halt_tx: watch::Sender<bool>,
}

impl PeerConnection {
    pub fn new(
        peer_addr: PeerAddr,
        peer_id: [u8; 20],
        num_pieces: usize,
    ) -> (Arc<Self>, PeerChannels) {
        let (to_peer_tx, to_peer_rx) = mpsc::channel(TO_PEER_CHANNEL_CAPACITY);
        let (halt_tx, halt_rx) = watch::channel(false);
        let connection = PeerConnection {
            peer_addr,
            peer_id,
            num_pieces,
            state: Mutex::new(PeerState {
                status: ConnectionState::Established,
                haves: None,
                choked: true,
                choking: true,
                interested: false,
                interesting: false,
                outstanding: Vec::new(),
                tasks: Vec::new(),
                queued_replies: HashMap::new(),
                bandwidth: BandwidthTracker::new(),
                last_block: Instant::now(),
            }),
            to_peer_tx,
            halt_tx,
        };
        (
            Arc::new(connection),
            PeerChannels {
                to_peer_rx,
                halt_rx,
            },
        )
    }

    pub fn peer_addr(&self) -> &PeerAddr {
        &self.peer_addr
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn status(&self) -> ConnectionState {
        lock(&self.state).status
    }

    pub fn haves(&self) -> Option<BitVector> {
        lock(&self.state).haves.clone()
    }

    pub fn outstanding(&self) -> Vec<BlockRequest> {
        lock(&self.state).outstanding.clone()
    }

    pub fn tasks(&self) -> Vec<Arc<DownloadTask>> {
        lock(&self.state).tasks.clone()
    }

    pub fn stats(&self) -> PeerStats {
        let state = lock(&self.state);
        PeerStats {
            interested: state.interested,
            choking: state.choking,
            choked: state.choked,
            download_rate: state.bandwidth.download_rate(),
            upload_rate: state.bandwidth.upload_rate(),
            snubbing: !state.choked
                && !state.outstanding.is_empty()
                && state.last_block.elapsed() > SNUB_TIMEOUT,
        }
    }

    pub fn mark(&self) {
        lock(&self.state).bandwidth.mark();
    }

    pub fn block_sent(&self, len: usize) {
        lock(&self.state).bandwidth.add_uploaded_bytes(len as u64);
    }

    /// Marks the connection closed and wakes its reader and writer. Returns
    /// false if it was already closed.
    pub fn close(&self) -> bool {
        let mut state = lock(&self.state);
        if state.status == ConnectionState::Closed {
            return false;
        }
        state.status = ConnectionState::Closed;
        state.outstanding.clear();
        state.tasks.clear();
        state.queued_replies.clear();
        drop(state);
        self.halt_tx.send_replace(true);
        log::debug!("connection with peer {} closed", self.peer_addr);
        true
    }

    pub async fn send(&self, message: Message) {
        if self.to_peer_tx.send(ToPeerMsg::Send(message)).await.is_err() {
            log::trace!("writer of peer {} is gone, message dropped", self.peer_addr);
        }
    }

    /// Queues a message without waiting, for use before the writer starts.
    pub fn try_send(&self, message: Message) -> bool {
        self.to_peer_tx.try_send(ToPeerMsg::Send(message)).is_ok()
    }

    /// Chokes or unchokes the peer; sends nothing if the flag is unchanged.
    pub async fn set_choking(&self, choking: bool) {
        {
            let mut state = lock(&self.state);
            if state.status == ConnectionState::Closed || state.choking == choking {
                return;
            }
            state.choking = choking;
            if choking {
                // replies still in the queue are not written
                state.queued_replies.clear();
            }
        }
        log::debug!(
            "{} peer {}",
            if choking { "choking" } else { "unchoking" },
            self.peer_addr
        );
        self.send(if choking {
            Message::Choke
        } else {
            Message::Unchoke
        })
        .await;
    }

    /// Re-evaluates whether the peer has something we want, after our own
    /// set of wanted pieces changed.
    pub async fn refresh_interest(&self, scheduler: &PieceScheduler) {
        let mut outbox = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.status == ConnectionState::Closed {
                return;
            }
            self.update_interest(&mut state, scheduler, &mut outbox);
        }
        for message in outbox {
            self.send(message).await;
        }
    }

    /// Applies one inbound message. An error means the connection must be
    /// closed.
    pub async fn handle_message(
        &self,
        manager: &TorrentManager,
        message: Message,
    ) -> Result<(), ProtocolError> {
        let scheduler = manager.scheduler();
        let mut outbox = Vec::new();
        let mut notify_choker = false;
        let mut completed = None;
        let mut to_serve = None;
        {
            let mut state = lock(&self.state);
            if state.status == ConnectionState::Closed {
                return Ok(());
            }
            // a peer owning nothing may skip the bitfield
            if state.haves.is_none() && !matches!(message, Message::KeepAlive | Message::Bitfield(_))
            {
                state.haves = Some(BitVector::new(self.num_pieces));
            }

            match message {
                Message::KeepAlive => {}
                Message::Choke => {
                    log::debug!(
                        "choked by peer {} with {} outstanding requests",
                        self.peer_addr,
                        state.outstanding.len()
                    );
                    state.choked = true;
                    state.outstanding.clear();
                }
                Message::Unchoke => {
                    state.choked = false;
                    state.last_block = Instant::now();
                    self.refill(&mut state, scheduler, &mut outbox);
                }
                Message::Interested => {
                    if !state.interested {
                        state.interested = true;
                        notify_choker = true;
                    }
                }
                Message::NotInterested => state.interested = false,
                Message::Have(piece_idx) => {
                    if piece_idx as usize >= self.num_pieces {
                        return Err(ProtocolError::violation(format!(
                            "have for piece {piece_idx} but the torrent has {} pieces",
                            self.num_pieces
                        )));
                    }
                    if let Some(haves) = state.haves.as_mut() {
                        if !haves.get(piece_idx as usize) {
                            haves
                                .set(piece_idx as usize, true)
                                .map_err(|e| ProtocolError::violation(e.to_string()))?;
                            scheduler.peer_has(piece_idx);
                        }
                    }
                    self.update_interest(&mut state, scheduler, &mut outbox);
                }
                Message::Bitfield(bitfield) => {
                    if state.haves.is_some() {
                        return Err(ProtocolError::violation(
                            "bitfield received after ownership was already known",
                        ));
                    }
                    log::trace!("peer {} has {bitfield} pieces", self.peer_addr);
                    scheduler.peer_bitfield(&bitfield);
                    state.haves = Some(bitfield);
                    self.update_interest(&mut state, scheduler, &mut outbox);
                }
                Message::Request(request) => {
                    if state.choking || !state.interested {
                        log::trace!(
                            "dropping request from peer {} ({request}): choking: {}, interested: {}",
                            self.peer_addr,
                            state.choking,
                            state.interested
                        );
                    } else {
                        to_serve = Some(request);
                    }
                }
                Message::Piece(piece_idx, begin, data) => {
                    let received = BlockRequest {
                        piece_idx,
                        block_begin: begin,
                        data_len: data.len() as u32,
                    };
                    let Some(pos) = state.outstanding.iter().position(|r| *r == received) else {
                        return Err(ProtocolError::violation(format!(
                            "block not requested: {received}"
                        )));
                    };
                    state.outstanding.remove(pos);
                    state.bandwidth.add_downloaded_bytes(data.len() as u64);
                    state.last_block = Instant::now();
                    manager.block_downloaded(data.len());
                    let task = state
                        .tasks
                        .iter()
                        .find(|t| t.piece_idx() == piece_idx)
                        .cloned();
                    if let Some(task) = task {
                        if let BlockOutcome::Completed(buffer) = task.block_received(begin, &data) {
                            completed = Some((piece_idx, buffer));
                        }
                    }
                    self.refill(&mut state, scheduler, &mut outbox);
                }
                Message::Cancel(request) => {
                    if state.queued_replies.remove(&request).is_some() {
                        log::trace!("peer {} cancelled queued reply ({request})", self.peer_addr);
                    }
                }
                Message::Port(port) => {
                    log::trace!("ignoring dht port {port} from peer {}", self.peer_addr);
                }
            }
        }

        if notify_choker {
            manager.peer_interested(&self.peer_addr).await;
        }
        if let Some((piece_idx, buffer)) = completed {
            manager.got_piece(piece_idx, buffer);
        }
        if let Some(request) = to_serve {
            if let Some(reply) = serve(manager, &request) {
                if self.queue_reply(request) {
                    outbox.push(reply);
                }
            } else {
                log::debug!(
                    "dropping request from peer {} we cannot serve: {request}",
                    self.peer_addr
                );
            }
        }
        for message in outbox {
            log::trace!("queueing for peer {}: {message}", self.peer_addr);
            self.send(message).await;
        }
        Ok(())
    }

    /// Called by the writer before putting a Piece reply on the wire. False
    /// when the reply was cancelled or the peer got choked meanwhile.
    pub fn take_reply(&self, request: &BlockRequest) -> bool {
        let mut state = lock(&self.state);
        let Some(count) = state.queued_replies.get_mut(request) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            state.queued_replies.remove(request);
        }
        true
    }

    fn queue_reply(&self, request: BlockRequest) -> bool {
        let mut state = lock(&self.state);
        if state.status == ConnectionState::Closed || state.choking {
            return false;
        }
        *state.queued_replies.entry(request).or_insert(0) += 1;
        true
    }

    fn update_interest(
        &self,
        state: &mut PeerState,
        scheduler: &PieceScheduler,
        outbox: &mut Vec<Message>,
    ) {
        let interesting = state
            .haves
            .as_ref()
            .is_some_and(|haves| scheduler.is_interesting(haves));
        if interesting != state.interesting {
            state.interesting = interesting;
            outbox.push(if interesting {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
        self.refill(state, scheduler, outbox);
    }

    /// Tops up the outstanding requests to `REQUEST_WINDOW`, first from the
    /// tasks this connection already helps, then from new scheduler work.
    fn refill(&self, state: &mut PeerState, scheduler: &PieceScheduler, outbox: &mut Vec<Message>) {
        if state.choked || !state.interesting {
            return;
        }
        let PeerState {
            haves,
            outstanding,
            tasks,
            ..
        } = state;
        tasks.retain(|t| !t.is_done());
        loop {
            let missing = REQUEST_WINDOW.saturating_sub(outstanding.len());
            if missing == 0 {
                break;
            }
            let requests: Vec<BlockRequest> = tasks
                .iter()
                .flat_map(|t| t.requests(missing, outstanding.as_slice()))
                .take(missing)
                .collect();
            if !requests.is_empty() {
                for request in requests {
                    outstanding.push(request);
                    outbox.push(Message::Request(request));
                }
                continue;
            }
            let Some(haves) = haves.as_ref() else {
                break;
            };
            match scheduler.next_piece(&self.peer_addr, haves) {
                Some(task) if !tasks.iter().any(|t| Arc::ptr_eq(t, &task)) => tasks.push(task),
                _ => break,
            }
        }
    }
}

fn serve(manager: &TorrentManager, request: &BlockRequest) -> Option<Message> {
    let metainfo = manager.metainfo();
    if request.piece_idx as usize >= metainfo.number_of_pieces()
        || request.data_len == 0
        || request.data_len > MAX_REQUEST_LENGTH
    {
        return None;
    }
    let begin = request.block_begin as usize;
    let end = begin + request.data_len as usize;
    if end > metainfo.piece_size(request.piece_idx) || !manager.storage().has(request.piece_idx) {
        return None;
    }
    match manager.storage().piece(request.piece_idx) {
        Ok(piece) => Some(Message::Piece(
            request.piece_idx,
            request.block_begin,
            piece[begin..end].to_vec(),
        )),
        Err(e) => {
            log::error!("error reading piece {}: {e:#}", request.piece_idx);
            None
        }
    }
}

impl fmt::Display for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = lock(&self.state);
        write!(
            f,
            "peer {} ({}) {}: choked: {}, choking: {}, interested: {}, interesting: {}, outstanding: {}, haves: {}, {}",
            self.peer_addr,
            force_string(&self.peer_id),
            state.status,
            state.choked,
            state.choking,
            state.interested,
            state.interesting,
            state.outstanding.len(),
            state
                .haves
                .as_ref()
                .map_or("unknown".to_string(), |h| h.to_string()),
            state.bandwidth
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_chokes_both_ways() {
        let (connection, mut channels) = PeerConnection::new("10.0.0.1:6881".to_string(), [7; 20], 10);
        assert_eq!(connection.status(), ConnectionState::Established);
        let stats = connection.stats();
        assert!(stats.choked && stats.choking && !stats.interested && !stats.snubbing);
        assert!(connection.haves().is_none());

        assert!(connection.close());
        assert!(!connection.close());
        assert_eq!(connection.status(), ConnectionState::Closed);
        assert!(*channels.halt_rx.borrow_and_update());
    }

    #[tokio::test]
    async fn choking_changes_are_sent_once() {
        let (connection, mut channels) = PeerConnection::new("10.0.0.1:6881".to_string(), [7; 20], 10);
        connection.set_choking(true).await;
        connection.set_choking(false).await;
        connection.set_choking(false).await;
        assert_matches!(channels.to_peer_rx.try_recv(), Ok(ToPeerMsg::Send(Message::Unchoke)));
        assert!(channels.to_peer_rx.try_recv().is_err());
        assert!(!connection.stats().choking);

        connection.close();
        connection.set_choking(true).await;
        assert!(channels.to_peer_rx.try_recv().is_err());
    }
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::manager::peer::HANDSHAKE_TIMEOUT;
use crate::manager::torrent_manager::TorrentManager;
use crate::metadata::metainfo::Metainfo;
use crate::persistence::storage::Storage;
use crate::torrent_protocol::wire_protocol::{Handshake, Protocol};
use crate::tracker::TrackerClient;
use crate::util::{force_string, generate_peer_id, pretty_info_hash};
use crate::worker::DeferredWorker;

const HALT_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPTOR_CHANNEL_CAPACITY: usize = 64;

pub enum AcceptorCommand {
    Register(Arc<TorrentManager>),
    Unregister([u8; 20]),
}

struct Inbound {
    stream: TcpStream,
    handshake: Handshake,
    addr: SocketAddr,
}

/// Owns the listening socket and the table of torrents that accept inbound
/// connections.
struct Acceptor {
    listener: TcpListener,
    managers: HashMap<[u8; 20], Arc<TorrentManager>>,
    commands: Receiver<AcceptorCommand>,
}

impl Acceptor {
    async fn run(mut self, mut halt: watch::Receiver<bool>) {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(ACCEPTOR_CHANNEL_CAPACITY);
        loop {
            tokio::select! {
                _ = halt.changed() => break,
                command = self.commands.recv() => match command {
                    Some(AcceptorCommand::Register(manager)) => {
                        self.managers.insert(manager.info_hash(), manager);
                    }
                    Some(AcceptorCommand::Unregister(info_hash)) => {
                        self.managers.remove(&info_hash);
                    }
                    None => break,
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::trace!("incoming connection from {addr}");
                        tokio::spawn(read_handshake(stream, addr, inbound_tx.clone()));
                    }
                    Err(e) => log::warn!("could not accept incoming connection: {e}"),
                },
                Some(inbound) = inbound_rx.recv() => self.dispatch(inbound),
            }
        }
        log::debug!("acceptor stopped");
    }

    fn dispatch(&self, inbound: Inbound) {
        let Inbound {
            mut stream,
            handshake,
            addr,
        } = inbound;
        let Some(manager) = self.managers.get(&handshake.info_hash).cloned() else {
            log::debug!(
                "peer {addr} asked for unknown torrent {}, closing",
                pretty_info_hash(handshake.info_hash)
            );
            return;
        };
        if !manager.need_more() {
            log::trace!("reached limit of connections, closing new connection from {addr}");
            return;
        }
        tokio::spawn(async move {
            let reply = Handshake::new(manager.info_hash(), manager.peer_id());
            match timeout(HANDSHAKE_TIMEOUT, stream.send_handshake(&reply)).await {
                Err(_elapsed) => {
                    log::trace!("handshake timeout with peer {addr}");
                    return;
                }
                Ok(Err(e)) => {
                    log::trace!("handshake failed with peer {addr}: {e}");
                    return;
                }
                Ok(Ok(())) => {}
            }
            if let Err(e) = manager.add_peer(addr.to_string(), handshake.peer_id, stream) {
                log::debug!(
                    "refusing peer {addr} ({}): {e}",
                    force_string(&handshake.peer_id)
                );
            }
        });
    }
}

async fn read_handshake(mut stream: TcpStream, addr: SocketAddr, tx: Sender<Inbound>) {
    match timeout(HANDSHAKE_TIMEOUT, stream.receive_handshake()).await {
        Err(_elapsed) => log::trace!("handshake timeout with peer {addr}"),
        Ok(Err(e)) => log::trace!("handshake failed with peer {addr}: {e}"),
        Ok(Ok(handshake)) => {
            log::trace!("received handshake from {addr}: {handshake}");
            let _ = tx
                .send(Inbound {
                    stream,
                    handshake,
                    addr,
                })
                .await;
        }
    }
}

/// Process-wide context: the deferred worker, the acceptor and the torrents.
pub struct Client {
    port: u16,
    worker: DeferredWorker,
    worker_handle: JoinHandle<()>,
    acceptor_tx: Sender<AcceptorCommand>,
    acceptor_handle: JoinHandle<()>,
    halt_tx: watch::Sender<bool>,
    torrents: Vec<(Arc<TorrentManager>, Vec<JoinHandle<()>>)>,
}

impl Client {
    /// Binds the listening port (0 picks a free one) and starts the shared
    /// tasks.
    pub async fn start(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("could not listen on port {port}"))?;
        let port = listener.local_addr()?.port();
        log::info!("listening for peers on port {port}");

        let (worker, worker_handle) = DeferredWorker::start();
        let (acceptor_tx, commands) = mpsc::channel(ACCEPTOR_CHANNEL_CAPACITY);
        let (halt_tx, halt_rx) = watch::channel(false);
        let acceptor = Acceptor {
            listener,
            managers: HashMap::new(),
            commands,
        };
        let acceptor_handle = tokio::spawn(acceptor.run(halt_rx));
        Ok(Client {
            port,
            worker,
            worker_handle,
            acceptor_tx,
            acceptor_handle,
            halt_tx,
            torrents: Vec::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn add_torrent(
        &mut self,
        metainfo: Arc<Metainfo>,
        storage: Arc<dyn Storage>,
    ) -> Result<Arc<TorrentManager>> {
        let peer_id = generate_peer_id();
        let tracker = TrackerClient::new(
            metainfo.info_hash(),
            peer_id,
            &metainfo.announce_list,
            self.port,
        )?;
        if tracker.urls().iter().all(|tier| tier.is_empty()) {
            log::warn!("torrent has no http tracker, only inbound connections will be used");
        }
        let manager = TorrentManager::new(
            metainfo,
            storage,
            peer_id,
            self.worker.clone(),
            StdRng::from_os_rng(),
        );
        let handles = manager.start(tracker);
        self.acceptor_tx
            .send(AcceptorCommand::Register(manager.clone()))
            .await
            .context("acceptor is not running")?;
        self.torrents.push((manager.clone(), handles));
        Ok(manager)
    }

    /// Stops a torrent and forgets it. Returns false for an unknown info hash.
    pub async fn remove_torrent(&mut self, info_hash: [u8; 20]) -> bool {
        let Some(pos) = self
            .torrents
            .iter()
            .position(|(m, _)| m.info_hash() == info_hash)
        else {
            return false;
        };
        let (manager, handles) = self.torrents.remove(pos);
        let _ = self
            .acceptor_tx
            .send(AcceptorCommand::Unregister(info_hash))
            .await;
        halt_manager(&manager, handles).await;
        true
    }

    pub async fn halt(self) {
        log::info!("halting client");
        for (manager, handles) in self.torrents {
            halt_manager(&manager, handles).await;
        }
        self.worker.halt();
        self.halt_tx.send_replace(true);
        for handle in [self.worker_handle, self.acceptor_handle] {
            if timeout(HALT_TIMEOUT, handle).await.is_err() {
                log::warn!("timed out waiting for a client task to stop");
            }
        }
    }
}

async fn halt_manager(manager: &TorrentManager, handles: Vec<JoinHandle<()>>) {
    manager.halt();
    for handle in handles {
        if timeout(HALT_TIMEOUT, handle).await.is_err() {
            log::warn!(
                "timed out waiting for torrent {} to stop",
                pretty_info_hash(manager.info_hash())
            );
        }
    }
}

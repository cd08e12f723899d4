use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc::Receiver, watch};
use tokio::time::timeout;

use crate::manager::peer_connection::{ConnectionState, PeerChannels, PeerConnection};
use crate::manager::torrent_manager::TorrentManager;
use crate::torrent_protocol::wire_protocol::{
    BlockRequest, Handshake, Message, Protocol, ProtocolError, ProtocolReadHalf,
    ProtocolWriteHalf,
};
use crate::util::{force_string, pretty_info_hash};

pub const KEEP_ALIVE: Duration = Duration::from_secs(120); // idle time before the writer sends a keep-alive
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(180); // keep-alive interval plus margin
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub type PeerAddr = String;

#[derive(Debug)]
pub enum ToPeerMsg {
    Send(Message),
}

/// Opens an outbound connection: we send our handshake first, then read and
/// check the remote one. On success the connection is handed to the manager.
pub async fn connect_to_new_peer(manager: Arc<TorrentManager>, addr: SocketAddr) {
    let mut state = ConnectionState::Connecting;
    log::trace!("initiating connection to peer: {addr}");
    let result = timeout(HANDSHAKE_TIMEOUT, async {
        let mut stream = TcpStream::connect(addr).await?;
        state = ConnectionState::Handshaking;
        let handshake =
            outbound_handshake(&mut stream, manager.info_hash(), manager.peer_id()).await?;
        Ok::<_, ProtocolError>((stream, handshake))
    })
    .await;
    manager.connect_finished(&addr);

    match result {
        Err(_elapsed) => {
            log::trace!("timed out with peer {addr} while {state}");
        }
        Ok(Err(e)) => {
            log::trace!("could not connect to peer {addr} while {state}: {e}");
        }
        Ok(Ok((stream, handshake))) => {
            if let Err(e) = manager.add_peer(addr.to_string(), handshake.peer_id, stream) {
                log::debug!("dropping new connection to {addr}: {e}");
            }
        }
    }
}

pub async fn outbound_handshake<S: Protocol>(
    stream: &mut S,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
) -> Result<Handshake, ProtocolError> {
    stream
        .send_handshake(&Handshake::new(info_hash, peer_id))
        .await?;
    let handshake = stream.receive_handshake().await?;
    log::trace!("received handshake: {handshake}");
    check_info_hash(&handshake, info_hash)?;
    Ok(handshake)
}

pub fn check_info_hash(handshake: &Handshake, info_hash: [u8; 20]) -> Result<(), ProtocolError> {
    if handshake.info_hash != info_hash {
        return Err(ProtocolError::violation(format!(
            "info hash mismatch (own: {}, theirs: {})",
            pretty_info_hash(info_hash),
            pretty_info_hash(handshake.info_hash)
        )));
    }
    Ok(())
}

pub fn start_peer_msg_handlers<S>(
    manager: Arc<TorrentManager>,
    connection: Arc<PeerConnection>,
    stream: S,
    channels: PeerChannels,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    tokio::spawn(rcv_message_handler(
        manager.clone(),
        connection.clone(),
        read,
        channels.halt_rx.clone(),
    ));
    tokio::spawn(snd_message_handler(
        manager,
        connection,
        write,
        channels.to_peer_rx,
        channels.halt_rx,
    ));
}

async fn rcv_message_handler<T: ProtocolReadHalf>(
    manager: Arc<TorrentManager>,
    connection: Arc<PeerConnection>,
    mut wire_proto: T,
    mut halt: watch::Receiver<bool>,
) {
    let peer_addr = connection.peer_addr().clone();
    let num_pieces = connection.num_pieces();
    let result = loop {
        let received = tokio::select! {
            _ = halt.changed() => break Ok(()),
            r = timeout(RECEIVE_TIMEOUT, wire_proto.receive(num_pieces)) => r,
        };
        let message = match received {
            Err(_elapsed) => break Err(ProtocolError::Timeout("waiting for a message")),
            Ok(Err(e)) => break Err(e),
            Ok(Ok(message)) => message,
        };
        log::trace!("received from {peer_addr}: {message}");
        if let Err(e) = connection.handle_message(&manager, message).await {
            break Err(e);
        }
    };

    match result {
        Ok(()) => log::trace!("reader of peer {peer_addr} halted"),
        Err(e @ (ProtocolError::Wire(_) | ProtocolError::Violation(_))) => {
            log::warn!("closing connection with peer {peer_addr}: {e}");
        }
        Err(e) => log::debug!("closing connection with peer {peer_addr}: {e}"),
    }
    manager.remove_peer(&peer_addr);
}

async fn snd_message_handler<T: ProtocolWriteHalf>(
    manager: Arc<TorrentManager>,
    connection: Arc<PeerConnection>,
    mut wire_proto: T,
    mut to_peer_rx: Receiver<ToPeerMsg>,
    mut halt: watch::Receiver<bool>,
) {
    let peer_addr = connection.peer_addr().clone();
    loop {
        let next = tokio::select! {
            _ = halt.changed() => break,
            m = timeout(KEEP_ALIVE, to_peer_rx.recv()) => m,
        };
        let message = match next {
            Err(_elapsed) => Message::KeepAlive,
            Ok(None) => break,
            Ok(Some(ToPeerMsg::Send(message))) => message,
        };

        // a queued reply is dropped if we choked the peer or it cancelled the request
        if let Message::Piece(piece_idx, begin, data) = &message {
            let request = BlockRequest {
                piece_idx: *piece_idx,
                block_begin: *begin,
                data_len: data.len() as u32,
            };
            if !connection.take_reply(&request) {
                log::trace!("not sending cancelled or choked block to peer {peer_addr} ({request})");
                continue;
            }
        }

        log::trace!("sending message {message} to peer {peer_addr}");
        match timeout(SEND_TIMEOUT, wire_proto.send(&message)).await {
            Err(_elapsed) => {
                log::debug!("timeout sending message to peer {peer_addr}");
                break;
            }
            Ok(Err(e)) => {
                log::debug!("sending failed with peer {peer_addr}: {e}");
                break;
            }
            Ok(Ok(())) => {}
        }
        if let Message::Piece(_, _, data) = &message {
            connection.block_sent(data.len());
            manager.block_uploaded(data.len());
        }
    }
    // wakes the reader, which releases the peer
    connection.close();
    log::trace!(
        "writer of peer {peer_addr} ({}) stopped",
        force_string(&connection.peer_id())
    );
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::time::Instant;

    use super::*;
    use crate::metadata::metainfo::tests::sample_metainfo;
    use crate::persistence::memory_storage::MemoryStorage;
    use crate::persistence::storage::Storage;
    use crate::worker::DeferredWorker;

    fn seeding_manager() -> (Arc<TorrentManager>, Vec<Vec<u8>>) {
        let (metainfo, contents) = sample_metainfo(2, 2 * 16384);
        let metainfo = Arc::new(metainfo);
        let storage = Arc::new(MemoryStorage::new(metainfo.clone()));
        for (idx, content) in contents.iter().enumerate() {
            assert!(storage.write_piece(idx as u32, content).unwrap());
        }
        let (worker, _) = DeferredWorker::start();
        let manager = TorrentManager::new(
            metainfo,
            storage,
            [1; 20],
            worker,
            StdRng::seed_from_u64(3),
        );
        (manager, contents)
    }

    fn connection() -> (Arc<PeerConnection>, PeerChannels) {
        PeerConnection::new("10.0.0.9:6881".to_string(), [2; 20], 2)
    }

    // the returned stream reads what the writer puts on the wire
    fn start_writer(
        manager: &Arc<TorrentManager>,
        connection: &Arc<PeerConnection>,
        channels: PeerChannels,
    ) -> DuplexStream {
        let (local, remote) = duplex(64 * 1024);
        tokio::spawn(snd_message_handler(
            manager.clone(),
            connection.clone(),
            local,
            channels.to_peer_rx,
            channels.halt_rx,
        ));
        remote
    }

    async fn unchoke(manager: &TorrentManager, connection: &PeerConnection) {
        connection
            .handle_message(manager, Message::Interested)
            .await
            .unwrap();
        connection.set_choking(false).await;
    }

    fn block(piece_idx: u32, block_begin: u32) -> BlockRequest {
        BlockRequest {
            piece_idx,
            block_begin,
            data_len: 16384,
        }
    }

    #[tokio::test]
    async fn outbound_handshake_checks_info_hash() {
        let (mut local, mut remote) = duplex(1024);
        let remote_task = tokio::spawn(async move {
            let theirs = remote.receive_handshake().await.unwrap();
            assert_eq!(theirs.peer_id, [1; 20]);
            remote
                .send_handshake(&Handshake::new([9; 20], [2; 20]))
                .await
                .unwrap();
        });
        let result = outbound_handshake(&mut local, [9; 20], [1; 20]).await;
        assert_matches!(result, Ok(h) => assert_eq!(h.peer_id, [2; 20]));
        remote_task.await.unwrap();

        let (mut local, mut remote) = duplex(1024);
        tokio::spawn(async move {
            let _ = remote.receive_handshake().await;
            let _ = remote
                .send_handshake(&Handshake::new([8; 20], [2; 20]))
                .await;
        });
        let result = outbound_handshake(&mut local, [9; 20], [1; 20]).await;
        assert_matches!(result, Err(ProtocolError::Violation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_writer_sends_keep_alive() {
        let (manager, _) = seeding_manager();
        let (connection, channels) = connection();
        let start = Instant::now();
        let mut remote = start_writer(&manager, &connection, channels);

        let mut frame = [0xff; 4];
        remote.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0; 4]);
        assert!(start.elapsed() >= KEEP_ALIVE);
        connection.close();
    }

    #[tokio::test]
    async fn queued_reply_is_dropped_after_choking() {
        let (manager, contents) = seeding_manager();
        let (connection, channels) = connection();
        unchoke(&manager, &connection).await;
        connection
            .handle_message(&manager, Message::Request(block(1, 0)))
            .await
            .unwrap();
        connection.set_choking(true).await;

        let mut remote = start_writer(&manager, &connection, channels);
        assert_matches!(remote.receive(2).await, Ok(Message::Unchoke));
        assert_matches!(remote.receive(2).await, Ok(Message::Choke));
        assert_eq!(manager.stats().uploaded(), 0);

        connection.set_choking(false).await;
        connection
            .handle_message(&manager, Message::Request(block(1, 0)))
            .await
            .unwrap();
        assert_matches!(remote.receive(2).await, Ok(Message::Unchoke));
        assert_matches!(
            remote.receive(2).await,
            Ok(Message::Piece(1, 0, data)) => assert_eq!(data, contents[1][..16384])
        );
        connection.close();
    }

    #[tokio::test]
    async fn cancel_drops_only_unsent_replies() {
        let (manager, contents) = seeding_manager();
        let (connection, channels) = connection();
        unchoke(&manager, &connection).await;

        // cancelled while still queued
        connection
            .handle_message(&manager, Message::Request(block(0, 0)))
            .await
            .unwrap();
        connection
            .handle_message(&manager, Message::Cancel(block(0, 0)))
            .await
            .unwrap();
        connection.send(Message::Have(1)).await;
        let mut remote = start_writer(&manager, &connection, channels);
        assert_matches!(remote.receive(2).await, Ok(Message::Unchoke));
        assert_matches!(remote.receive(2).await, Ok(Message::Have(1)));

        // a cancel arriving after the reply went out does not affect a new request
        let second_block = contents[1][16384..].to_vec();
        connection
            .handle_message(&manager, Message::Request(block(1, 16384)))
            .await
            .unwrap();
        assert_matches!(
            remote.receive(2).await,
            Ok(Message::Piece(1, 16384, data)) => assert_eq!(data, second_block)
        );
        connection
            .handle_message(&manager, Message::Cancel(block(1, 16384)))
            .await
            .unwrap();
        connection
            .handle_message(&manager, Message::Request(block(1, 16384)))
            .await
            .unwrap();
        assert_matches!(
            remote.receive(2).await,
            Ok(Message::Piece(1, 16384, data)) => assert_eq!(data, second_block)
        );
        connection.close();
    }
}

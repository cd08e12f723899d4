use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::torrent_protocol::wire_protocol::{
    decode_payload, encode, Handshake, Message, Protocol, ProtocolError, ProtocolReadHalf,
    ProtocolWriteHalf, WireError, HANDSHAKE_BASE_LENGTH, MAX_FRAME_LENGTH, PROTOCOL_STRING,
};
use crate::util::force_string;

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Protocol for S {
    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), ProtocolError> {
        self.write_all(&handshake.encode()).await?;
        self.flush().await?;
        Ok(())
    }

    async fn receive_handshake(&mut self) -> Result<Handshake, ProtocolError> {
        let mut pstr_len_buf: [u8; 1] = [0; 1];
        self.read_exact(&mut pstr_len_buf).await?;

        let mut buf = vec![0; HANDSHAKE_BASE_LENGTH + pstr_len_buf[0] as usize];
        buf[0] = pstr_len_buf[0];
        self.read_exact(&mut buf[1..]).await?;

        let handshake = Handshake::decode(&buf)?;
        if handshake.pstr != PROTOCOL_STRING {
            return Err(ProtocolError::violation(format!(
                "unexpected protocol string: {}",
                force_string(&handshake.pstr)
            )));
        }
        Ok(handshake)
    }
}

impl<W: AsyncWrite + Unpin + Send> ProtocolWriteHalf for W {
    async fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        self.write_all(&encode(message)).await?;
        Ok(())
    }
}

impl<R: AsyncRead + Unpin + Send> ProtocolReadHalf for R {
    async fn receive(&mut self, num_pieces: usize) -> Result<Message, ProtocolError> {
        // get size of message
        let mut size_message_buf: [u8; 4] = [0; 4];
        self.read_exact(&mut size_message_buf).await?;
        let size_message = u32::from_be_bytes(size_message_buf) as usize;
        if size_message == 0 {
            return Ok(Message::KeepAlive);
        }
        if size_message > MAX_FRAME_LENGTH {
            return Err(WireError::FrameTooLarge(size_message).into());
        }

        let mut payload = vec![0; size_message];
        self.read_exact(&mut payload).await?;
        Ok(decode_payload(&payload, num_pieces)?)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;
    use crate::bitfield::BitVector;
    use crate::torrent_protocol::wire_protocol::BlockRequest;

    #[tokio::test]
    async fn handshake_over_stream() {
        let (mut a, mut b) = duplex(1024);
        let ours = Handshake::new([7; 20], *b"-PW0100-abcdefghijkl");
        a.send_handshake(&ours).await.unwrap();
        let theirs = b.receive_handshake().await.unwrap();
        assert_eq!(theirs, ours);
    }

    #[tokio::test]
    async fn handshake_with_wrong_protocol_is_rejected() {
        let (mut a, mut b) = duplex(1024);
        let mut bogus = Handshake::new([7; 20], [1; 20]);
        bogus.pstr = b"BitTorrent protocoX".to_vec();
        a.send_handshake(&bogus).await.unwrap();
        assert_matches!(
            b.receive_handshake().await,
            Err(ProtocolError::Violation(_))
        );
    }

    #[tokio::test]
    async fn frames_are_read_one_at_a_time() {
        let (mut a, mut b) = duplex(1 << 16);
        let mut bitfield = BitVector::new(10);
        bitfield.set(5, true).unwrap();
        let sent = vec![
            Message::Bitfield(bitfield),
            Message::KeepAlive,
            Message::Request(BlockRequest {
                piece_idx: 5,
                block_begin: 0,
                data_len: 16384,
            }),
            Message::Piece(5, 0, vec![3; 100]),
        ];
        for m in &sent {
            a.send(m).await.unwrap();
        }
        for m in sent {
            assert_eq!(b.receive(10).await.unwrap(), m);
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        assert_matches!(
            b.receive(10).await,
            Err(ProtocolError::Wire(WireError::FrameTooLarge(_)))
        );
    }

    #[tokio::test]
    async fn closed_stream_is_a_transport_error() {
        let (a, mut b) = duplex(64);
        drop(a);
        assert_matches!(b.receive(10).await, Err(ProtocolError::Transport(_)));
    }
}

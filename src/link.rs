//! Framed packet I/O on the physical link between a server-side driver and the relay. Frames are
//!  written back to back on a byte stream (usually TCP); the frame header carries the payload
//!  length, so no additional length prefix is needed.

use std::io::ErrorKind;
use std::sync::RwLock;

use anyhow::bail;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::connection::PacketSink;
use crate::packet::{FrameHeader, Packet, MAX_PACKET_SIZE};

/// An upper bound for coalescing queued frames into a single write
const WRITE_BATCH_SIZE: usize = 4 * MAX_PACKET_SIZE;

pub struct LinkReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> LinkReader<R> {
    pub fn new(reader: R) -> LinkReader<R> {
        LinkReader { reader }
    }

    /// Reads the next well-formed packet, returning `None` when the stream ended.
    ///
    /// A frame with a bad checksum is skipped since its length is still trustworthy. A header
    ///  that can not be parsed at all means that framing is lost, and the link is unusable.
    pub async fn read_packet(&mut self) -> anyhow::Result<Option<Packet>> {
        let mut header_buf = [0u8; FrameHeader::SERIALIZED_LEN];
        loop {
            match self.reader.read_exact(&mut header_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }

            let header = match FrameHeader::deser(&mut header_buf.as_slice()) {
                Ok(header) => header,
                Err(e) => bail!("unparsable frame header on link: {}", e),
            };

            let mut payload = vec![0u8; header.payload_len];
            self.reader.read_exact(&mut payload).await?;

            match header.into_packet(payload.into()) {
                Ok(packet) => {
                    trace!("received {:?} on link", packet);
                    return Ok(Some(packet));
                }
                Err(e) => warn!("dropping malformed frame on link: {}", e),
            }
        }
    }
}

pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> anyhow::Result<()> {
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes queued packets to the link until the queue is closed or writing fails. Packets that
///  are queued at the same time are coalesced into a single write.
pub async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut queue: mpsc::Receiver<Packet>) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    while let Some(packet) = queue.recv().await {
        buf.clear();
        packet.ser(&mut buf);
        while buf.len() < WRITE_BATCH_SIZE {
            match queue.try_recv() {
                Ok(packet) => packet.ser(&mut buf),
                Err(_) => break,
            }
        }

        writer.write_all(&buf).await?;
        writer.flush().await?;
    }
    debug!("link send queue closed");
    Ok(())
}

/// A [PacketSink] feeding a bounded send queue. On the server driver, the sink outlives individual
///  link sessions: it is attached to the send queue of the current session and detached while the
///  link is down. Packets sent while detached are dropped and recovered by retransmission or link
///  init replay. On the client, each connection has its own sink feeding its push task.
#[derive(Default)]
pub struct LinkSink {
    queue: RwLock<Option<mpsc::Sender<Packet>>>,
}

impl LinkSink {
    pub fn new() -> LinkSink {
        Default::default()
    }

    pub fn attach(&self, queue: mpsc::Sender<Packet>) {
        *self.queue.write().unwrap() = Some(queue);
    }

    pub fn detach(&self) {
        *self.queue.write().unwrap() = None;
    }

    pub fn is_attached(&self) -> bool {
        self.queue.read().unwrap().is_some()
    }

    /// Sends a packet that is never retransmitted (handshake replies): if the send queue is full,
    ///  this waits for room instead of dropping the packet.
    pub async fn send_control(&self, packet: Packet) {
        let queue = self.queue.read().unwrap().clone();
        let Some(queue) = queue else {
            trace!("send queue detached - dropping {:?}", packet);
            return;
        };

        if let Err(e) = queue.send(packet).await {
            trace!("send queue is closing - dropping {:?}", e.0);
        }
    }
}

impl PacketSink for LinkSink {
    fn send_packet(&self, packet: Packet) {
        let queue = self.queue.read().unwrap();
        let Some(queue) = queue.as_ref() else {
            trace!("send queue detached - dropping {:?}", packet);
            return;
        };

        match queue.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => debug!("send queue is full - dropping {:?}", packet),
            Err(TrySendError::Closed(packet)) => trace!("send queue is closing - dropping {:?}", packet),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ConnectionId, PacketKind};
    use crate::seq_no::SeqNo;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time;

    fn data(seq: u64, payload: &'static [u8]) -> Packet {
        Packet::sequenced(PacketKind::Data, ConnectionId::from_raw(5), SeqNo::from_raw(seq), Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (client, server) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::channel(16);
        let writer = tokio::spawn(write_loop(client, rx));

        tx.send(data(1, b"a")).await.unwrap();
        tx.send(Packet::no_op()).await.unwrap();
        tx.send(data(2, b"bc")).await.unwrap();
        drop(tx);
        writer.await.unwrap().unwrap();

        let mut reader = LinkReader::new(server);
        assert_eq!(reader.read_packet().await.unwrap(), Some(data(1, b"a")));
        assert_eq!(reader.read_packet().await.unwrap(), Some(Packet::no_op()));
        assert_eq!(reader.read_packet().await.unwrap(), Some(data(2, b"bc")));
        assert_eq!(reader.read_packet().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_control_waits_for_room() {
        let sink = Arc::new(LinkSink::new());
        let (tx, mut rx) = mpsc::channel(1);
        sink.attach(tx);

        sink.send_packet(data(1, b"a"));
        sink.send_packet(data(2, b"b"));

        let control = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.send_control(Packet::no_op()).await })
        };
        time::sleep(Duration::from_millis(10)).await;
        assert!(!control.is_finished());

        assert_eq!(rx.recv().await, Some(data(1, b"a")));
        control.await.unwrap();
        assert_eq!(rx.recv().await, Some(Packet::no_op()));
    }

    #[tokio::test]
    async fn test_send_control_detached() {
        let sink = LinkSink::new();
        let (tx, mut rx) = mpsc::channel(1);
        sink.attach(tx);
        sink.detach();

        sink.send_control(Packet::no_op()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_skipped() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&data(1, b"a").encode());
        let mut corrupt = data(2, b"b").encode().to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;
        stream.extend_from_slice(&corrupt);
        stream.extend_from_slice(&data(3, b"c").encode());

        let mut reader = LinkReader::new(stream.as_slice());
        assert_eq!(reader.read_packet().await.unwrap(), Some(data(1, b"a")));
        assert_eq!(reader.read_packet().await.unwrap(), Some(data(3, b"c")));
        assert_eq!(reader.read_packet().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lost_framing_is_an_error() {
        let mut frame = data(1, b"a").encode().to_vec();
        frame[0] = 77;
        let mut reader = LinkReader::new(frame.as_slice());
        assert!(reader.read_packet().await.is_err());
    }

    #[tokio::test]
    async fn test_link_sink() {
        let sink = LinkSink::new();
        sink.send_packet(data(1, b"dropped"));
        assert!(!sink.is_attached());

        let (tx, mut rx) = mpsc::channel(1);
        sink.attach(tx);
        sink.send_packet(data(2, b"x"));
        sink.send_packet(data(3, b"queue full"));
        assert_eq!(rx.recv().await, Some(data(2, b"x")));
        assert!(rx.try_recv().is_err());

        sink.detach();
        assert_eq!(rx.recv().await, None);
    }
}

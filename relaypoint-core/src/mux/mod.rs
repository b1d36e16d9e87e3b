use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::negotiate::MsgChannel;
use crate::secure::{Role, SecureConn, SecureRead, SecureWrite};

/// The built-in stream multiplexing protocol, negotiated by ID after the
/// security phase.
pub const PROTOCOL_ID: &str = "/relaypoint/mux/1.0.0";

/// Largest payload carried by one frame; writes are chunked to fit.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

const FRAME_HEAD_LEN: usize = 5;
const STREAM_QUEUE: usize = 32;
const OUT_QUEUE: usize = 64;

/// Stream id 0 never carries a stream; a frame for it closes the whole
/// connection (sent as the last frame by whichever side closes first).
const CONN_CLOSE_ID: u32 = 0;

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub(crate) enum Flag {
    Syn,
    Data,
    Fin,
    Rst,
    Unknown = 255,
}

impl From<u8> for Flag {
    fn from(value: u8) -> Self {
        match value {
            0 => Flag::Syn,
            1 => Flag::Data,
            2 => Flag::Fin,
            3 => Flag::Rst,
            _ => Flag::Unknown,
        }
    }
}

pub(crate) struct Frame {
    id: u32,
    flag: Flag,
    payload: Bytes,
}

impl Frame {
    fn new(id: u32, flag: Flag, payload: Bytes) -> Frame {
        Frame { id, flag, payload }
    }

    fn rst(id: u32) -> Frame {
        Frame::new(id, Flag::Rst, Bytes::new())
    }

    fn conn_close() -> Frame {
        Frame::new(CONN_CLOSE_ID, Flag::Rst, Bytes::new())
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEAD_LEN + self.payload.len());
        buf.put_u32(self.id);
        buf.put_u8(self.flag as u8);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    fn decode(mut msg: Bytes) -> io::Result<Frame> {
        if msg.len() < FRAME_HEAD_LEN {
            return Err(io::Error::from(io::ErrorKind::InvalidData));
        }
        let head = msg.split_to(FRAME_HEAD_LEN);
        let id = u32::from_be_bytes(head[..4].try_into().unwrap());
        let flag = Flag::from(head[4]);
        if msg.len() > MAX_FRAME_PAYLOAD {
            return Err(io::Error::from(io::ErrorKind::InvalidData));
        }
        Ok(Frame {
            id,
            flag,
            payload: msg,
        })
    }
}

struct Shared {
    peer: PeerId,
    streams: DashMap<u32, mpsc::Sender<Bytes>>,
    out_tx: mpsc::Sender<Frame>,
    next_id: AtomicU32,
    activity: AtomicCell<Instant>,
    closed: AtomicBool,
}

impl Shared {
    fn touch(&self) {
        self.activity.store(Instant::now());
    }
}

/// Cheap-to-clone control surface of one multiplexed connection.
#[derive(Clone)]
pub struct MuxHandle {
    shared: Arc<Shared>,
}

/// A multiplexed connection: the control handle, the queue of streams the
/// remote opened, and the two I/O task handles.
pub struct Muxer {
    pub handle: MuxHandle,
    pub incoming: mpsc::Receiver<Stream>,
    pub read_task: JoinHandle<()>,
    pub write_task: JoinHandle<()>,
}

/// Splits a secured connection into independent logical streams. The
/// dialer allocates odd stream ids, the listener even ones.
pub fn start(conn: SecureConn, role: Role) -> Muxer {
    let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE);
    let (incoming_tx, incoming) = mpsc::channel(16);
    let shared = Arc::new(Shared {
        peer: conn.peer,
        streams: DashMap::new(),
        out_tx,
        next_id: AtomicU32::new(match role {
            Role::Initiator => 1,
            Role::Responder => 2,
        }),
        activity: AtomicCell::new(Instant::now()),
        closed: AtomicBool::new(false),
    });
    let read_task = tokio::spawn(read_loop(conn.read, shared.clone(), incoming_tx));
    let write_task = tokio::spawn(write_loop(conn.write, out_rx, shared.clone()));
    Muxer {
        handle: MuxHandle { shared },
        incoming,
        read_task,
        write_task,
    }
}

impl MuxHandle {
    pub fn peer(&self) -> PeerId {
        self.shared.peer
    }

    pub fn last_activity(&self) -> Instant {
        self.shared.activity.load()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }

    pub async fn open_stream(&self) -> Result<Stream> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.shared.streams.insert(id, tx);
        if self
            .shared
            .out_tx
            .send(Frame::new(id, Flag::Syn, Bytes::new()))
            .await
            .is_err()
        {
            self.shared.streams.remove(&id);
            return Err(Error::StreamClosed);
        }
        Ok(Stream {
            id,
            rx,
            shared: self.shared.clone(),
            fin_sent: false,
        })
    }

    /// Closes the whole connection: the close frame is flushed to the
    /// remote, the sink shuts down and every open stream reads to its end.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        _ = self.shared.out_tx.send(Frame::conn_close()).await;
    }
}

/// One logical stream inside a multiplexed connection. Reads are
/// message-framed; writes larger than [`MAX_FRAME_PAYLOAD`] are chunked.
pub struct Stream {
    id: u32,
    rx: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
    fin_sent: bool,
}

impl Stream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> PeerId {
        self.shared.peer
    }

    /// The next data chunk, or `None` once the remote half-closed or the
    /// connection went away.
    pub async fn read(&mut self) -> Option<Bytes> {
        let chunk = self.rx.recv().await;
        if chunk.is_some() {
            self.shared.touch();
        }
        chunk
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.fin_sent {
            return Err(Error::StreamClosed);
        }
        for chunk in buf.chunks(MAX_FRAME_PAYLOAD) {
            self.shared
                .out_tx
                .send(Frame::new(
                    self.id,
                    Flag::Data,
                    Bytes::copy_from_slice(chunk),
                ))
                .await
                .map_err(|_| Error::StreamClosed)?;
        }
        Ok(())
    }

    /// Half-close: the remote's `read` sees the end of stream, while its
    /// writes to us still flow.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.fin_sent {
            return Ok(());
        }
        self.fin_sent = true;
        self.shared
            .out_tx
            .send(Frame::new(self.id, Flag::Fin, Bytes::new()))
            .await
            .map_err(|_| Error::StreamClosed)?;
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.streams.remove(&self.id);
        if !self.fin_sent {
            _ = self.shared.out_tx.try_send(Frame::rst(self.id));
        }
    }
}

#[async_trait]
impl MsgChannel for Stream {
    async fn send_msg(&mut self, msg: &[u8]) -> Result<()> {
        if msg.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::MessageTooLarge(msg.len()));
        }
        self.write(msg).await
    }

    async fn recv_msg(&mut self) -> Result<Bytes> {
        self.read().await.ok_or(Error::Eof)
    }
}

async fn read_loop(mut read: SecureRead, shared: Arc<Shared>, incoming_tx: mpsc::Sender<Stream>) {
    loop {
        let msg = match read.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                log::debug!("mux read {:?}: {e:?}", shared.peer);
                break;
            }
        };
        let frame = match Frame::decode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("mux frame {:?}: {e:?}", shared.peer);
                break;
            }
        };
        shared.touch();
        if frame.id == CONN_CLOSE_ID {
            break;
        }
        match frame.flag {
            Flag::Syn => {
                if shared.streams.contains_key(&frame.id) {
                    continue;
                }
                let (tx, rx) = mpsc::channel(STREAM_QUEUE);
                shared.streams.insert(frame.id, tx);
                let stream = Stream {
                    id: frame.id,
                    rx,
                    shared: shared.clone(),
                    fin_sent: false,
                };
                if incoming_tx.send(stream).await.is_err() {
                    shared.streams.remove(&frame.id);
                    _ = shared.out_tx.send(Frame::rst(frame.id)).await;
                }
            }
            Flag::Data => {
                let sender = shared.streams.get(&frame.id).map(|e| e.value().clone());
                match sender {
                    Some(sender) => {
                        if sender.send(frame.payload).await.is_err() {
                            shared.streams.remove(&frame.id);
                            _ = shared.out_tx.send(Frame::rst(frame.id)).await;
                        }
                    }
                    None => {
                        _ = shared.out_tx.send(Frame::rst(frame.id)).await;
                    }
                }
            }
            Flag::Fin | Flag::Rst => {
                shared.streams.remove(&frame.id);
            }
            Flag::Unknown => {
                log::debug!("mux unknown flag from {:?}", shared.peer);
            }
        }
    }
    shared.closed.store(true, Ordering::Relaxed);
    shared.streams.clear();
    _ = shared.out_tx.send(Frame::conn_close()).await;
}

async fn write_loop(mut write: SecureWrite, mut out_rx: mpsc::Receiver<Frame>, shared: Arc<Shared>) {
    while let Some(frame) = out_rx.recv().await {
        let closing = frame.id == CONN_CLOSE_ID;
        if let Err(e) = write.send(&frame.encode()).await {
            log::debug!("mux write {:?}: {e:?}", shared.peer);
            break;
        }
        shared.touch();
        if closing {
            break;
        }
    }
    shared.closed.store(true, Ordering::Relaxed);
    _ = write.close().await;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::Keypair;
    use crate::secure::{self, Role};
    use crate::transport::{self, Listener};

    async fn muxer_pair() -> (Muxer, Muxer) {
        let server_key = Keypair::generate();
        let client_key = Keypair::generate();
        let listener = Listener::bind(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let dial_addr = listener.local_addr().clone();

        let server_task = tokio::spawn(async move {
            let (stream, remote, ws) = listener.accept().await.unwrap();
            let raw = transport::upgrade_inbound(stream, remote, ws).await.unwrap();
            let conn = secure::handshake(Role::Responder, &server_key, raw)
                .await
                .unwrap();
            start(conn, Role::Responder)
        });
        let raw = transport::dial(&dial_addr).await.unwrap();
        let conn = secure::handshake(Role::Initiator, &client_key, raw)
            .await
            .unwrap();
        let client = start(conn, Role::Initiator);
        (client, server_task.await.unwrap())
    }

    #[tokio::test]
    async fn streams_interleave_independently() {
        let (client, mut server) = muxer_pair().await;

        let mut a = client.handle.open_stream().await.unwrap();
        let mut b = client.handle.open_stream().await.unwrap();
        a.write(b"first stream").await.unwrap();
        b.write(b"second stream").await.unwrap();

        let mut in_a = server.incoming.recv().await.unwrap();
        let mut in_b = server.incoming.recv().await.unwrap();
        assert_eq!(in_a.read().await.unwrap().as_ref(), b"first stream");
        assert_eq!(in_b.read().await.unwrap().as_ref(), b"second stream");

        in_b.write(b"reply on b").await.unwrap();
        in_a.write(b"reply on a").await.unwrap();
        assert_eq!(a.read().await.unwrap().as_ref(), b"reply on a");
        assert_eq!(b.read().await.unwrap().as_ref(), b"reply on b");
    }

    #[tokio::test]
    async fn large_writes_are_chunked() {
        let (client, mut server) = muxer_pair().await;
        let mut out = client.handle.open_stream().await.unwrap();
        let payload = vec![7u8; MAX_FRAME_PAYLOAD * 2 + 17];
        out.write(&payload).await.unwrap();
        out.shutdown().await.unwrap();

        let mut inbound = server.incoming.recv().await.unwrap();
        let mut got = Vec::new();
        while let Some(chunk) = inbound.read().await {
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn fin_ends_remote_reads() {
        let (client, mut server) = muxer_pair().await;
        let mut out = client.handle.open_stream().await.unwrap();
        out.write(b"bye").await.unwrap();
        out.shutdown().await.unwrap();

        let mut inbound = server.incoming.recv().await.unwrap();
        assert_eq!(inbound.read().await.unwrap().as_ref(), b"bye");
        assert!(inbound.read().await.is_none());

        // The half-close is one-directional: the server side still writes.
        inbound.write(b"still open").await.unwrap();
        assert_eq!(out.read().await.unwrap().as_ref(), b"still open");
    }

    #[tokio::test]
    async fn close_tears_down_both_sides() {
        let (client, mut server) = muxer_pair().await;
        let mut out = client.handle.open_stream().await.unwrap();
        out.write(b"x").await.unwrap();
        let mut inbound = server.incoming.recv().await.unwrap();
        assert_eq!(inbound.read().await.unwrap().as_ref(), b"x");

        client.handle.close().await;
        assert!(inbound.read().await.is_none());
        assert!(server.incoming.recv().await.is_none());
    }
}

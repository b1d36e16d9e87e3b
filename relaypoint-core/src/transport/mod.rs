use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};

use crate::addr::Multiaddr;
use crate::error::{Error, Result};

pub mod tcp;
pub mod ws;

/// Upper bound on a single framed message, enforced by every transport.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024;

/// Receiving half of a message-oriented connection.
#[async_trait]
pub trait MsgStream: Send {
    /// The next message, or `None` once the remote closed cleanly.
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

/// Sending half of a message-oriented connection.
#[async_trait]
pub trait MsgSink: Send {
    async fn send(&mut self, msg: Bytes) -> io::Result<()>;
    async fn close(&mut self) -> io::Result<()>;
}

/// An established transport connection, before security negotiation.
pub struct RawConn {
    pub read: Box<dyn MsgStream>,
    pub write: Box<dyn MsgSink>,
    pub local_addr: Multiaddr,
    pub remote_addr: Multiaddr,
}

/// A bound listener for one listen multiaddress. The transport is chosen
/// by the address suffix: plain length-prefixed TCP, or WebSocket when the
/// address carries `/ws`.
pub struct Listener {
    inner: TcpListener,
    ws: bool,
    local_addr: Multiaddr,
}

impl Listener {
    pub async fn bind(addr: &Multiaddr) -> Result<Listener> {
        let socket = addr
            .socket_addr()
            .ok_or_else(|| Error::UnsupportedTransport(addr.to_string()))?;
        let ws = addr.is_ws();
        let inner = TcpListener::bind(socket).await?;
        let local_addr = Multiaddr::from_socket_addr(inner.local_addr()?, ws);
        Ok(Listener {
            inner,
            ws,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> &Multiaddr {
        &self.local_addr
    }

    /// Accepts one raw TCP session. The transport upgrade (framing or
    /// WebSocket handshake) runs in [`upgrade_inbound`] so a slow remote
    /// cannot stall the accept loop.
    pub async fn accept(&self) -> io::Result<(TcpStream, Multiaddr, bool)> {
        let (stream, remote) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, Multiaddr::from_socket_addr(remote, self.ws), self.ws))
    }
}

/// Finishes the transport layer for an accepted session.
pub async fn upgrade_inbound(
    stream: TcpStream,
    remote_addr: Multiaddr,
    ws: bool,
) -> io::Result<RawConn> {
    let local_addr = Multiaddr::from_socket_addr(stream.local_addr()?, ws);
    let (read, write) = if ws {
        ws::accept(stream).await?
    } else {
        tcp::framed(stream)
    };
    Ok(RawConn {
        read,
        write,
        local_addr,
        remote_addr,
    })
}

/// Dials the transport described by `addr` (any `/p2p` suffix ignored).
pub async fn dial(addr: &Multiaddr) -> Result<RawConn> {
    let target = addr.transport_part();
    let socket = target
        .socket_addr()
        .ok_or_else(|| Error::UnsupportedTransport(addr.to_string()))?;
    let stream = TcpStream::connect(socket).await?;
    stream.set_nodelay(true)?;
    let ws = target.is_ws();
    let local_addr = Multiaddr::from_socket_addr(stream.local_addr()?, ws);
    let (read, write) = if ws {
        ws::connect(stream, socket).await?
    } else {
        tcp::framed(stream)
    };
    Ok(RawConn {
        read,
        write,
        local_addr,
        remote_addr: Multiaddr::from_socket_addr(socket, ws),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    async fn round_trip(listen: &str) {
        let listener = Listener::bind(&listen.parse().unwrap()).await.unwrap();
        let dial_addr = listener.local_addr().clone();

        let server = tokio::spawn(async move {
            let (stream, remote, ws) = listener.accept().await.unwrap();
            let mut conn = upgrade_inbound(stream, remote, ws).await.unwrap();
            let msg = conn.read.recv().await.unwrap().unwrap();
            conn.write.send(msg).await.unwrap();
            conn.write.close().await.unwrap();
        });

        let mut conn = dial(&dial_addr).await.unwrap();
        conn.write.send(Bytes::from_static(b"ping")).await.unwrap();
        let echoed = conn.read.recv().await.unwrap().unwrap();
        assert_eq!(echoed.as_ref(), b"ping");
        assert!(conn.read.recv().await.unwrap().is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_round_trip() {
        round_trip("/ip4/127.0.0.1/tcp/0").await;
    }

    #[tokio::test]
    async fn ws_round_trip() {
        round_trip("/ip4/127.0.0.1/tcp/0/ws").await;
    }

    #[tokio::test]
    async fn dial_unsupported_addr() {
        let bad: Multiaddr = format!("/p2p/{}", crate::identity::Keypair::generate().peer_id())
            .parse()
            .unwrap();
        assert!(matches!(
            dial(&bad).await,
            Err(Error::UnsupportedTransport(_))
        ));
    }
}

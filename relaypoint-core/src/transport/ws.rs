use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{MsgSink, MsgStream, MAX_MESSAGE_LEN};

type Ws = WebSocketStream<TcpStream>;

pub(super) async fn accept(stream: TcpStream) -> io::Result<(Box<dyn MsgStream>, Box<dyn MsgSink>)> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(ws_err)?;
    Ok(split(ws))
}

pub(super) async fn connect(
    stream: TcpStream,
    addr: SocketAddr,
) -> io::Result<(Box<dyn MsgStream>, Box<dyn MsgSink>)> {
    let url = format!("ws://{addr}/");
    let (ws, _response) = tokio_tungstenite::client_async(url, stream)
        .await
        .map_err(ws_err)?;
    Ok(split(ws))
}

fn split(ws: Ws) -> (Box<dyn MsgStream>, Box<dyn MsgSink>) {
    let (sink, stream) = ws.split();
    (
        Box::new(WsMsgStream { inner: stream }),
        Box::new(WsMsgSink { inner: sink }),
    )
}

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

struct WsMsgStream {
    inner: SplitStream<Ws>,
}

#[async_trait]
impl MsgStream for WsMsgStream {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            let msg = match self.inner.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(ws_err(e)),
                None => return Ok(None),
            };
            match msg {
                Message::Binary(data) => {
                    if data.len() > MAX_MESSAGE_LEN {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("frame of {} bytes exceeds limit", data.len()),
                        ));
                    }
                    return Ok(Some(Bytes::from(data)));
                }
                Message::Close(_) => return Ok(None),
                // Control frames; pongs are produced by the sink half.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Text(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected text frame",
                    ))
                }
            }
        }
    }
}

struct WsMsgSink {
    inner: SplitSink<Ws, Message>,
}

#[async_trait]
impl MsgSink for WsMsgSink {
    async fn send(&mut self, msg: Bytes) -> io::Result<()> {
        if msg.len() > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid frame length {}", msg.len()),
            ));
        }
        self.inner
            .send(Message::Binary(msg.to_vec()))
            .await
            .map_err(ws_err)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.close().await.map_err(ws_err)
    }
}

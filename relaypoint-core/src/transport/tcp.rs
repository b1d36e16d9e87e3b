use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::{MsgSink, MsgStream, MAX_MESSAGE_LEN};

/// Length-prefixed message framing: 4-byte big-endian length, then the
/// payload. The zero-length frame is reserved for the sender's clean close.
pub fn framed(stream: TcpStream) -> (Box<dyn MsgStream>, Box<dyn MsgSink>) {
    let (read, write) = stream.into_split();
    (
        Box::new(TcpMsgStream { read }),
        Box::new(TcpMsgSink { write }),
    )
}

struct TcpMsgStream {
    read: OwnedReadHalf,
}

#[async_trait]
impl MsgStream for TcpMsgStream {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        let mut head = [0u8; 4];
        match self.read.read_exact(&mut head).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(head) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit"),
            ));
        }
        let mut buf = BytesMut::zeroed(len);
        self.read.read_exact(&mut buf).await?;
        Ok(Some(buf.freeze()))
    }
}

struct TcpMsgSink {
    write: OwnedWriteHalf,
}

#[async_trait]
impl MsgSink for TcpMsgSink {
    async fn send(&mut self, msg: Bytes) -> io::Result<()> {
        if msg.is_empty() || msg.len() > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid frame length {}", msg.len()),
            ));
        }
        let head = (msg.len() as u32).to_be_bytes();
        self.write.write_all(&head).await?;
        self.write.write_all(&msg).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.write.write_all(&0u32.to_be_bytes()).await?;
        self.write.shutdown().await
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::secure::SecureConn;
use crate::transport::RawConn;

/// Anything negotiation can run over: a raw transport connection (security
/// phase), a secured connection (mux phase), or a single logical stream
/// (application protocol phase).
#[async_trait]
pub trait MsgChannel: Send {
    async fn send_msg(&mut self, msg: &[u8]) -> Result<()>;
    async fn recv_msg(&mut self) -> Result<Bytes>;
}

#[async_trait]
impl MsgChannel for RawConn {
    async fn send_msg(&mut self, msg: &[u8]) -> Result<()> {
        self.write.send(Bytes::copy_from_slice(msg)).await?;
        Ok(())
    }

    async fn recv_msg(&mut self) -> Result<Bytes> {
        self.read.recv().await?.ok_or(Error::Eof)
    }
}

#[async_trait]
impl MsgChannel for SecureConn {
    async fn send_msg(&mut self, msg: &[u8]) -> Result<()> {
        self.write.send(msg).await
    }

    async fn recv_msg(&mut self) -> Result<Bytes> {
        self.read.recv().await?.ok_or(Error::Eof)
    }
}

#[derive(Serialize, Deserialize)]
struct Proposal {
    ids: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct Answer {
    id: Option<String>,
}

fn codec_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Handshake(format!("negotiation codec: {e}"))
}

/// Initiator side: advertises `supported` in preference order and returns
/// the ID the responder settled on. A refusal terminates the attempt with
/// [`Error::NegotiationFailed`].
pub async fn propose<C: MsgChannel + ?Sized>(channel: &mut C, supported: &[String]) -> Result<String> {
    let proposal = Proposal {
        ids: supported.to_vec(),
    };
    let encoded = rmp_serde::to_vec(&proposal).map_err(codec_err)?;
    channel.send_msg(&encoded).await?;
    let answer: Answer = rmp_serde::from_slice(&channel.recv_msg().await?).map_err(codec_err)?;
    match answer.id {
        Some(id) if supported.iter().any(|s| s == &id) => Ok(id),
        _ => Err(Error::NegotiationFailed),
    }
}

/// Responder side: picks the first of the initiator's IDs that is also in
/// `supported` (the initiator's preference order wins) and echoes the
/// choice. With no overlap the refusal is sent before the error returns,
/// so the initiator sees an explicit failure rather than a hang.
pub async fn accept<C, S>(channel: &mut C, supported: &[S]) -> Result<String>
where
    C: MsgChannel + ?Sized,
    S: AsRef<str> + Sync,
{
    let proposal: Proposal = rmp_serde::from_slice(&channel.recv_msg().await?).map_err(codec_err)?;
    let chosen = proposal
        .ids
        .into_iter()
        .find(|id| supported.iter().any(|s| s.as_ref() == id));
    let answer = Answer {
        id: chosen.clone(),
    };
    let encoded = rmp_serde::to_vec(&answer).map_err(codec_err)?;
    channel.send_msg(&encoded).await?;
    chosen.ok_or(Error::NegotiationFailed)
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc;

    struct PipeChannel {
        tx: mpsc::Sender<Bytes>,
        rx: mpsc::Receiver<Bytes>,
    }

    #[async_trait]
    impl MsgChannel for PipeChannel {
        async fn send_msg(&mut self, msg: &[u8]) -> Result<()> {
            self.tx
                .send(Bytes::copy_from_slice(msg))
                .await
                .map_err(|_| Error::StreamClosed)
        }

        async fn recv_msg(&mut self) -> Result<Bytes> {
            self.rx.recv().await.ok_or(Error::Eof)
        }
    }

    fn pipe() -> (PipeChannel, PipeChannel) {
        let (a_tx, a_rx) = mpsc::channel(8);
        let (b_tx, b_rx) = mpsc::channel(8);
        (
            PipeChannel { tx: a_tx, rx: b_rx },
            PipeChannel { tx: b_tx, rx: a_rx },
        )
    }

    #[tokio::test]
    async fn first_mutually_supported_wins() {
        let (mut a, mut b) = pipe();
        let proposer = tokio::spawn(async move {
            propose(&mut a, &["/x/2.0.0".to_string(), "/x/1.0.0".to_string()]).await
        });
        let chosen = accept(&mut b, &["/x/1.0.0", "/x/2.0.0"]).await.unwrap();
        // Proposer preference order decides, not the responder's.
        assert_eq!(chosen, "/x/2.0.0");
        assert_eq!(proposer.await.unwrap().unwrap(), "/x/2.0.0");
    }

    #[tokio::test]
    async fn no_overlap_is_an_explicit_failure() {
        let (mut a, mut b) = pipe();
        let proposer =
            tokio::spawn(async move { propose(&mut a, &["/only/here".to_string()]).await });
        let rs = accept(&mut b, &["/other"]).await;
        assert!(matches!(rs, Err(Error::NegotiationFailed)));
        assert!(matches!(
            proposer.await.unwrap(),
            Err(Error::NegotiationFailed)
        ));
    }
}

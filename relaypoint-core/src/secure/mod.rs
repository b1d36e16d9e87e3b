use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey as XPublicKey};

use crate::addr::Multiaddr;
use crate::error::{Error, Result};
use crate::identity::{verify_signature, Keypair, PeerId, PUBLIC_KEY_LEN};
use crate::transport::{MsgSink, MsgStream, RawConn};

/// The built-in channel security protocol, negotiated by ID before the
/// handshake runs.
pub const PROTOCOL_ID: &str = "/relaypoint/secure/1.0.0";

const SIG_CONTEXT_INITIATOR: &[u8] = b"relaypoint-secure-init:";
const SIG_CONTEXT_RESPONDER: &[u8] = b"relaypoint-secure-resp:";
const KEY_CONTEXT_I2R: &str = "relaypoint 2024 secure i2r";
const KEY_CONTEXT_R2I: &str = "relaypoint 2024 secure r2i";
const TAG_LEN: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Serialize, Deserialize)]
struct Hello {
    identity: Vec<u8>,
    ephemeral: Vec<u8>,
    signature: Vec<u8>,
}

/// An authenticated, encrypted connection to a verified [`PeerId`].
pub struct SecureConn {
    pub peer: PeerId,
    pub read: SecureRead,
    pub write: SecureWrite,
    pub local_addr: Multiaddr,
    pub remote_addr: Multiaddr,
}

pub struct SecureRead {
    inner: Box<dyn MsgStream>,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

pub struct SecureWrite {
    inner: Box<dyn MsgSink>,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

fn nonce_for(counter: u64) -> Nonce {
    let mut raw = [0u8; 12];
    raw[..8].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(raw)
}

impl SecureRead {
    /// The next decrypted message, or `None` once the remote closed.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        let Some(sealed) = self.inner.recv().await? else {
            return Ok(None);
        };
        if sealed.len() < TAG_LEN {
            return Err(Error::Crypto);
        }
        let plain = self
            .cipher
            .decrypt(&nonce_for(self.counter), sealed.as_ref())
            .map_err(|_| Error::Crypto)?;
        self.counter += 1;
        Ok(Some(Bytes::from(plain)))
    }
}

impl SecureWrite {
    pub async fn send(&mut self, msg: &[u8]) -> Result<()> {
        let sealed = self
            .cipher
            .encrypt(&nonce_for(self.counter), msg)
            .map_err(|_| Error::Crypto)?;
        self.counter += 1;
        self.inner.send(Bytes::from(sealed)).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }
}

/// Runs the channel handshake: each side proves possession of its identity
/// key over a fresh X25519 exchange, then all traffic is sealed with
/// ChaCha20-Poly1305 under direction-separated keys and counter nonces.
/// Returns the connection tagged with the remote's verified PeerId.
pub async fn handshake(role: Role, keypair: &Keypair, mut conn: RawConn) -> Result<SecureConn> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pub = XPublicKey::from(&ephemeral);

    let sig_context = match role {
        Role::Initiator => SIG_CONTEXT_INITIATOR,
        Role::Responder => SIG_CONTEXT_RESPONDER,
    };
    let hello = Hello {
        identity: keypair.public_bytes().to_vec(),
        ephemeral: ephemeral_pub.as_bytes().to_vec(),
        signature: keypair
            .sign(&[sig_context, ephemeral_pub.as_bytes().as_slice()].concat())
            .to_vec(),
    };
    let encoded = rmp_serde::to_vec(&hello).map_err(Error::handshake)?;

    // The initiator speaks first; the responder answers after verifying.
    let remote = match role {
        Role::Initiator => {
            conn.write.send(Bytes::from(encoded)).await?;
            recv_hello(&mut conn, SIG_CONTEXT_RESPONDER).await?
        }
        Role::Responder => {
            let remote = recv_hello(&mut conn, SIG_CONTEXT_INITIATOR).await?;
            conn.write.send(Bytes::from(encoded)).await?;
            remote
        }
    };

    let (remote_identity, remote_ephemeral) = remote;
    let peer = PeerId::from_public_key(
        &ed25519_dalek::VerifyingKey::from_bytes(&remote_identity).map_err(Error::handshake)?,
    );
    if peer == keypair.peer_id() {
        return Err(Error::Handshake("connected to self".to_string()));
    }

    let shared = ephemeral.diffie_hellman(&XPublicKey::from(remote_ephemeral));
    let (lo, hi) = if ephemeral_pub.as_bytes() <= &remote_ephemeral {
        (*ephemeral_pub.as_bytes(), remote_ephemeral)
    } else {
        (remote_ephemeral, *ephemeral_pub.as_bytes())
    };
    let material = [shared.as_bytes().as_slice(), lo.as_slice(), hi.as_slice()].concat();
    let key_i2r = blake3::derive_key(KEY_CONTEXT_I2R, &material);
    let key_r2i = blake3::derive_key(KEY_CONTEXT_R2I, &material);
    let (tx_key, rx_key) = match role {
        Role::Initiator => (key_i2r, key_r2i),
        Role::Responder => (key_r2i, key_i2r),
    };

    Ok(SecureConn {
        peer,
        read: SecureRead {
            inner: conn.read,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&rx_key)),
            counter: 0,
        },
        write: SecureWrite {
            inner: conn.write,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&tx_key)),
            counter: 0,
        },
        local_addr: conn.local_addr,
        remote_addr: conn.remote_addr,
    })
}

async fn recv_hello(
    conn: &mut RawConn,
    expected_context: &[u8],
) -> Result<([u8; PUBLIC_KEY_LEN], [u8; PUBLIC_KEY_LEN])> {
    let msg = conn.read.recv().await?.ok_or(Error::Eof)?;
    let hello: Hello = rmp_serde::from_slice(&msg).map_err(Error::handshake)?;
    let identity: [u8; PUBLIC_KEY_LEN] = hello
        .identity
        .as_slice()
        .try_into()
        .map_err(|_| Error::Handshake("bad identity key length".to_string()))?;
    let ephemeral: [u8; PUBLIC_KEY_LEN] = hello
        .ephemeral
        .as_slice()
        .try_into()
        .map_err(|_| Error::Handshake("bad ephemeral key length".to_string()))?;
    let signed = [expected_context, ephemeral.as_slice()].concat();
    if !verify_signature(&identity, &signed, &hello.signature) {
        return Err(Error::Handshake("signature verification failed".to_string()));
    }
    Ok((identity, ephemeral))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::{self, Listener};

    async fn secure_pair() -> (SecureConn, SecureConn, Keypair, Keypair) {
        let server_key = Keypair::generate();
        let client_key = Keypair::generate();
        let listener = Listener::bind(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let dial_addr = listener.local_addr().clone();

        let server_task = {
            let key = server_key.clone();
            tokio::spawn(async move {
                let (stream, remote, ws) = listener.accept().await.unwrap();
                let raw = transport::upgrade_inbound(stream, remote, ws).await.unwrap();
                handshake(Role::Responder, &key, raw).await.unwrap()
            })
        };
        let raw = transport::dial(&dial_addr).await.unwrap();
        let client_conn = handshake(Role::Initiator, &client_key, raw).await.unwrap();
        let server_conn = server_task.await.unwrap();
        (client_conn, server_conn, client_key, server_key)
    }

    #[tokio::test]
    async fn handshake_verifies_identity_and_roundtrips() {
        let (mut client, mut server, client_key, server_key) = secure_pair().await;
        assert_eq!(client.peer, server_key.peer_id());
        assert_eq!(server.peer, client_key.peer_id());

        client.write.send(b"hello through the tunnel").await.unwrap();
        let got = server.read.recv().await.unwrap().unwrap();
        assert_eq!(got.as_ref(), b"hello through the tunnel");

        server.write.send(b"and back").await.unwrap();
        let got = client.read.recv().await.unwrap().unwrap();
        assert_eq!(got.as_ref(), b"and back");
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_rejected() {
        let (mut client, mut server, _, _) = secure_pair().await;
        client.write.send(b"payload").await.unwrap();
        // Valid traffic decrypts; replaying the same counter with altered
        // bytes must not. Simulate by sending garbage straight through a
        // second message and expecting a Crypto error.
        client.write.counter = 0;
        client.write.send(b"replay with stale counter").await.unwrap();
        assert!(server.read.recv().await.unwrap().is_some());
        assert!(matches!(server.read.recv().await, Err(Error::Crypto)));
    }
}

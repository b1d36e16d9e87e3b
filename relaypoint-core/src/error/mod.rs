use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("eof")]
    Eof,
    #[error("identity key file corrupt: {0}")]
    CorruptKeyFile(String),
    #[error("invalid multiaddr: {0}")]
    InvalidAddr(String),
    #[error("no mutually supported protocol")]
    NegotiationFailed,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("authenticated decryption failed")]
    Crypto,
    #[error("stream closed")]
    StreamClosed,
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
    #[error("no transport for address: {0}")]
    UnsupportedTransport(String),
}

impl Error {
    pub(crate) fn handshake<E: std::fmt::Display>(e: E) -> Error {
        Error::Handshake(e.to_string())
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

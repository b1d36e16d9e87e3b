use relaypoint_core::identity::PeerId;
use thiserror::Error;

use crate::protocol::RelayStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] relaypoint_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(String),
    #[error("protocol handler already registered: {0}")]
    HandlerExists(String),
    #[error("not connected to {0}")]
    NotConnected(PeerId),
    #[error("relay refused: {0:?}")]
    Refused(RelayStatus),
    #[error("hole punch failed")]
    PunchFailed,
    #[error("timed out")]
    Timeout,
    #[error("shutting down")]
    Shutdown,
}

impl Error {
    pub(crate) fn codec<E: std::fmt::Display>(e: E) -> Error {
        Error::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

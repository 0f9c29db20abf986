//! Client error types.

use std::io;

use thiserror::Error;

/// Errors returned by the client API.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Invalid topic")]
    InvalidTopic,

    #[error("Transmit buffer full")]
    BufferFull,

    #[error("All request slots in use")]
    RequestsFull,
}

pub type Result<T> = std::result::Result<T, ClientError>;

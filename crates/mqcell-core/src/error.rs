//! Wire-level error types.

use thiserror::Error;

/// MQTT protocol errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

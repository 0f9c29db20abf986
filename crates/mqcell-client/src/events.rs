//! Session events delivered to the user layer.

use mqcell_core::packet::QoS;
use thiserror::Error;

/// Broker verdict on a connection attempt, or the reason the attempt never
/// reached the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// Connection accepted.
    Accepted,
    /// Broker does not support this protocol revision.
    UnacceptableProtocolVersion,
    /// Client identifier rejected.
    IdentifierRejected,
    /// MQTT service unavailable.
    ServerUnavailable,
    /// Bad username or password.
    BadUsernamePassword,
    /// Client is not authorized to connect.
    NotAuthorized,
    /// CONNACK return code outside the MQTT 3.1.1 range.
    Unknown(u8),
    /// The TCP connection could not be established.
    TcpFailed,
}

impl ConnectStatus {
    pub(crate) fn from_code(code: u8) -> Self {
        match code {
            0 => ConnectStatus::Accepted,
            1 => ConnectStatus::UnacceptableProtocolVersion,
            2 => ConnectStatus::IdentifierRejected,
            3 => ConnectStatus::ServerUnavailable,
            4 => ConnectStatus::BadUsernamePassword,
            5 => ConnectStatus::NotAuthorized,
            _ => ConnectStatus::Unknown(code),
        }
    }

    /// True for [`ConnectStatus::Accepted`].
    pub fn is_accepted(&self) -> bool {
        matches!(self, ConnectStatus::Accepted)
    }
}

/// Why a tracked request completed without success.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("Request rejected by broker")]
    Rejected,

    #[error("Connection closed before completion")]
    ConnectionClosed,
}

/// Outcome carried by request completion events.
pub type RequestResult = std::result::Result<(), RequestError>;

/// Session events.
///
/// `PublishRecv` borrows the topic and payload straight out of the receive
/// path; the data is only valid for the duration of the callback and is not
/// stored by the engine. Delivery is strictly edge-triggered.
#[derive(Debug)]
pub enum Event<'a, A = ()> {
    /// A connection attempt finished.
    Connect {
        /// Broker verdict, or `TcpFailed` when the transport never opened.
        status: ConnectStatus,
    },
    /// The connection closed. `is_accepted` is true when the session had
    /// been established (or was deliberately closing) beforehand.
    Disconnect { is_accepted: bool },
    /// An outbound publish completed.
    Publish { arg: A, res: RequestResult },
    /// A message arrived on a subscribed topic.
    PublishRecv {
        topic: &'a [u8],
        payload: &'a [u8],
        dup: bool,
        qos: QoS,
        retain: bool,
    },
    /// A subscribe request completed.
    Subscribe { arg: A, res: RequestResult },
    /// An unsubscribe request completed.
    Unsubscribe { arg: A, res: RequestResult },
    /// PINGRESP received from the broker.
    KeepAlive,
}

/// Receiver for session events.
///
/// Events are dispatched synchronously while a transport event is being
/// processed; handlers must not call back into the client and should
/// instead record what happened and act after the dispatch returns.
pub trait EventHandler<A = ()> {
    /// Handle a single event.
    fn on_event(&mut self, event: Event<'_, A>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_status_codes() {
        assert_eq!(ConnectStatus::from_code(0), ConnectStatus::Accepted);
        assert_eq!(ConnectStatus::from_code(5), ConnectStatus::NotAuthorized);
        assert_eq!(ConnectStatus::from_code(42), ConnectStatus::Unknown(42));
        assert!(ConnectStatus::from_code(0).is_accepted());
        assert!(!ConnectStatus::from_code(3).is_accepted());
    }
}

//! Session configuration captured when a connection is started.

use bytes::Bytes;
use mqcell_core::packet::QoS;

/// Last Will and Testament message.
///
/// Stored by the broker and published on the client's behalf if the
/// connection terminates abnormally.
#[derive(Debug, Clone)]
pub struct Will {
    /// Topic to publish the will message to.
    pub topic: String,
    /// Will message payload.
    pub payload: Bytes,
    /// QoS level for will delivery.
    pub qos: QoS,
    /// Retain request. Recorded but not transmitted: the CONNECT encoder
    /// leaves the will-retain flag clear.
    pub retain: bool,
}

impl Will {
    /// Create a new will message with QoS 0 and no retain.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set the QoS level for the will message.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set whether the will message should be retained.
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Per-session options. Read-only for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Client identifier, unique within the broker.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Clean session flag. The CONNECT packet always requests a clean
    /// session.
    pub clean_session: bool,
    /// Last Will and Testament message.
    pub will: Option<Will>,
}

impl SessionOptions {
    /// Create options with the given client identifier.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            will: None,
        }
    }

    /// Set username and password.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set the Last Will and Testament message.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_will_builder() {
        let will = Will::new("status/node1", "offline")
            .qos(QoS::AtLeastOnce)
            .retain(true);

        assert_eq!(will.topic, "status/node1");
        assert_eq!(will.payload.as_ref(), b"offline");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_options_builder() {
        let options = SessionOptions::new("node1")
            .credentials("user", "pass")
            .keep_alive(30);

        assert_eq!(options.client_id, "node1");
        assert_eq!(options.username.as_deref(), Some("user"));
        assert_eq!(options.password.as_deref(), Some(b"pass".as_slice()));
        assert_eq!(options.keep_alive, 30);
        assert!(options.clean_session);
        assert!(options.will.is_none());
    }
}

//! mqcell-client - Event-driven MQTT 3.1.1 client session engine.
//!
//! The engine targets byte-oriented transports that deliver connection
//! events from a single-threaded callback regime, such as a cellular
//! modem's socket layer. Outbound packets are encoded into a bounded ring
//! buffer and handed to the transport one contiguous block at a time;
//! inbound packets are reassembled incrementally from arbitrarily
//! fragmented receive buffers; QoS 0/1/2 completions are correlated
//! through a fixed-capacity request registry. The engine performs no I/O
//! of its own and never blocks.
//!
//! A mio-backed TCP transport and readiness driver live in [`net`] for
//! hosts that just want a socket.

mod buffer;
mod client;
mod error;
mod events;
mod options;
mod parser;
mod requests;
mod transport;

pub mod net;

pub use client::{MqttClient, CONN_POLL_INTERVAL_MS};
pub use error::{ClientError, Result};
pub use events::{ConnectStatus, Event, EventHandler, RequestError, RequestResult};
pub use net::{TcpDriver, TcpTransport};
pub use options::{SessionOptions, Will};
pub use requests::MAX_REQUESTS;
pub use transport::{RecvBuf, SegmentedBuf, Transport, TransportEvent};

// Re-export useful types from core
pub use mqcell_core::packet::QoS;

//! mqcell-core - Core MQTT 3.1.1 wire types and codec helpers.
//!
//! This crate provides the wire-level building blocks shared by the mqcell
//! crates: control packet types, fixed-header assembly and inspection, and
//! the variable byte integer encoding used for the remaining-length field.

pub mod error;
pub mod packet;
pub mod varint;

pub use error::{ProtocolError, Result};
pub use packet::*;

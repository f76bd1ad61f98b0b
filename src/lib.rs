//! Edgewire - binary wire-protocol engine for EdgeDB clients.
//!
//! Decodes server type descriptors into cached codec trees, specializes
//! them for the host types a caller asks for, and frames messages over an
//! async transport.

pub mod binary;
pub mod error;

pub use binary::{
    Cardinality, Codec, CodecCache, Connection, ConnectionConfig, HostShape, HostType, HostTyped,
    ProtocolVersion, Value,
};
pub use error::{EdgeError, Result};

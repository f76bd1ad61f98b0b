//! EdgeDB binary protocol engine.
//!
//! This module turns the server's self-describing type information into
//! codec trees and uses them to read and write query data:
//! - Type descriptors are decoded for both protocol dialects (1.x and 2.x)
//! - Codec trees are cached by type id and shared across queries
//! - Codecs are specialized per requested host type, memoized
//! - Messages are framed over any async transport with full-duplex locking
//!
//! Architecture:
//! - `buffer`: Pooled message buffers and bounded read cursors
//! - `protocol`: Message framing, client and server messages
//! - `descriptors`: Type descriptor decoding
//! - `codecs`: Codec tree nodes and the scalar catalogue
//! - `builder`: Descriptor sequence → codec tree, plus the codec cache
//! - `visitor`: Runtime specialization for host types
//! - `host`: Host type model
//! - `duplexer`: Transport ownership, send/receive, duplex streams
//! - `connection`: Handshake and query flow
//! - `query_cache`: Parsed query type ids (LRU)
//! - `config`: Connection configuration
//! - `scram`: SCRAM-SHA-256 authentication

pub mod buffer;
pub mod builder;
pub mod codecs;
pub mod config;
pub mod connection;
pub mod descriptors;
pub mod duplexer;
pub mod host;
pub mod protocol;
pub mod query_cache;
pub mod scram;
pub mod types;
pub mod visitor;

#[cfg(test)]
mod tests;

// Public API re-exports for library consumers
pub use buffer::{BufferContract, BufferPool, Packet};
pub use builder::CodecCache;
pub use codecs::{Codec, CodecRef};
pub use config::ConnectionConfig;
pub use connection::{Connection, Prepared};
pub use duplexer::{DuplexResult, DuplexStream, Duplexer, DuplexerState, FinishHandle};
pub use host::{HostShape, HostType, HostTyped};
pub use protocol::{Cardinality, ProtocolVersion};
pub use types::Value;
pub use visitor::specialize;

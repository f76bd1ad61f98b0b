//! EdgeDB binary protocol message encoding and decoding.
//!
//! Every message is framed as a 1-byte type tag followed by a big-endian u32
//! length that counts itself but not the tag, then the body.
//! Reference: https://www.edgedb.com/docs/reference/protocol/messages

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use super::buffer::{BufferContract, Packet};
use super::codecs::Codec;
use super::types::Value;
use crate::error::{EdgeError, ErrorSeverity, Result};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Size of the tag + length header preceding every message body.
pub const HEADER_LEN: usize = 5;

/// Upper bound on a single message body.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

/// Negotiated protocol version. Major 2 switched descriptor layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const V1_0: ProtocolVersion = ProtocolVersion::new(1, 0);
    pub const V2_0: ProtocolVersion = ProtocolVersion::new(2, 0);

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Whether type descriptors use the pre-2.0 layout.
    pub fn is_legacy(&self) -> bool {
        self.major < 2
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V2_0
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Message type tags sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerMessageType {
    Authentication = b'R',
    CommandComplete = b'C',
    CommandDataDescription = b'T',
    Data = b'D',
    DumpBlock = b'=',
    DumpHeader = b'@',
    ErrorResponse = b'E',
    LogMessage = b'L',
    ParameterStatus = b'S',
    ParseComplete = b'1',
    ReadyForCommand = b'Z',
    RestoreReady = b'+',
    ServerHandshake = b'v',
    ServerKeyData = b'K',
    StateDataDescription = b's',
}

impl TryFrom<u8> for ServerMessageType {
    type Error = EdgeError;

    fn try_from(b: u8) -> Result<Self> {
        Ok(match b {
            b'R' => ServerMessageType::Authentication,
            b'C' => ServerMessageType::CommandComplete,
            b'T' => ServerMessageType::CommandDataDescription,
            b'D' => ServerMessageType::Data,
            b'=' => ServerMessageType::DumpBlock,
            b'@' => ServerMessageType::DumpHeader,
            b'E' => ServerMessageType::ErrorResponse,
            b'L' => ServerMessageType::LogMessage,
            b'S' => ServerMessageType::ParameterStatus,
            b'1' => ServerMessageType::ParseComplete,
            b'Z' => ServerMessageType::ReadyForCommand,
            b'+' => ServerMessageType::RestoreReady,
            b'v' => ServerMessageType::ServerHandshake,
            b'K' => ServerMessageType::ServerKeyData,
            b's' => ServerMessageType::StateDataDescription,
            other => {
                return Err(EdgeError::protocol(format!(
                    "unknown server message type 0x{:02x}",
                    other
                )))
            }
        })
    }
}

/// Parsed 5-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub message_type: ServerMessageType,
    /// Body length, with the length field's own 4 bytes already subtracted.
    pub length: usize,
}

impl PacketHeader {
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        let message_type = ServerMessageType::try_from(raw[0])?;
        let wire_len = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]) as usize;
        if wire_len < 4 {
            return Err(EdgeError::protocol(format!(
                "message length {} is smaller than the length field",
                wire_len
            )));
        }
        let length = wire_len - 4;
        if length > MAX_MESSAGE_LEN {
            return Err(EdgeError::protocol(format!(
                "message length {} exceeds limit {}",
                length, MAX_MESSAGE_LEN
            )));
        }
        Ok(Self {
            message_type,
            length,
        })
    }

    /// Bytes this message occupies on the wire, header included.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.length
    }
}

/// Result cardinality of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cardinality {
    NoResult = 0x6e,
    AtMostOne = 0x6f,
    One = 0x41,
    Many = 0x6d,
    AtLeastOne = 0x4d,
}

impl TryFrom<u8> for Cardinality {
    type Error = EdgeError;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            0x6e => Ok(Cardinality::NoResult),
            0x6f => Ok(Cardinality::AtMostOne),
            0x41 => Ok(Cardinality::One),
            0x6d => Ok(Cardinality::Many),
            0x4d => Ok(Cardinality::AtLeastOne),
            other => Err(EdgeError::protocol(format!("unknown cardinality 0x{:02x}", other))),
        }
    }
}

/// Output format requested for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoFormat {
    Binary = b'b',
    Json = b'j',
    JsonElements = b'J',
    None = b'n',
}

/// Capability bits a command may require.
pub mod capabilities {
    pub const MODIFICATIONS: u64 = 1 << 0;
    pub const SESSION_CONFIG: u64 = 1 << 1;
    pub const TRANSACTION: u64 = 1 << 2;
    pub const DDL: u64 = 1 << 3;
    pub const PERSISTENT_CONFIG: u64 = 1 << 4;
    pub const ALL: u64 = 0xffff_ffff_ffff_ffff;
    /// Everything but transaction control, the default for ad-hoc queries.
    pub const DEFAULT: u64 = ALL & !TRANSACTION;
}

/// Transaction state reported by ReadyForCommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Not in a transaction block
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TryFrom<u8> for TransactionState {
    type Error = EdgeError;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            b'I' => Ok(TransactionState::Idle),
            b'T' => Ok(TransactionState::InTransaction),
            b'E' => Ok(TransactionState::Failed),
            other => Err(EdgeError::protocol(format!(
                "unknown transaction state 0x{:02x}",
                other
            ))),
        }
    }
}

/// Key/value annotation attached to several messages.
pub type Annotation = (String, String);

// ============================================================================
// Client -> Server Messages
// ============================================================================

/// A message the client can send.
/// `Sync` below is the protocol message, so the marker trait is spelled out.
pub trait ClientMessage: Send + std::marker::Sync {
    /// Message type tag.
    fn message_type(&self) -> u8;

    /// Write the body (without tag or length).
    fn encode_body(&self, body: &mut BytesMut);

    /// Append the framed message to `buf`.
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_type());
        let len_at = buf.len();
        buf.put_u32(0);
        self.encode_body(buf);
        // Length includes itself
        let len = (buf.len() - len_at) as u32;
        buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }
}

/// ClientHandshake ('V') - opens the session
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    pub version: ProtocolVersion,
    pub params: Vec<(String, String)>,
}

impl ClientMessage for ClientHandshake {
    fn message_type(&self) -> u8 {
        b'V'
    }

    fn encode_body(&self, body: &mut BytesMut) {
        body.put_u16(self.version.major);
        body.put_u16(self.version.minor);
        body.put_u16(self.params.len() as u16);
        for (name, value) in &self.params {
            put_string(body, name);
            put_string(body, value);
        }
        // No protocol extensions
        body.put_u16(0);
    }
}

/// AuthenticationSASLInitialResponse ('p')
#[derive(Debug, Clone)]
pub struct SaslInitialResponse {
    pub method: String,
    pub data: Vec<u8>,
}

impl ClientMessage for SaslInitialResponse {
    fn message_type(&self) -> u8 {
        b'p'
    }

    fn encode_body(&self, body: &mut BytesMut) {
        put_string(body, &self.method);
        put_bytes(body, &self.data);
    }
}

/// AuthenticationSASLResponse ('r')
#[derive(Debug, Clone)]
pub struct SaslResponse {
    pub data: Vec<u8>,
}

impl ClientMessage for SaslResponse {
    fn message_type(&self) -> u8 {
        b'r'
    }

    fn encode_body(&self, body: &mut BytesMut) {
        put_bytes(body, &self.data);
    }
}

/// Fields shared by Parse and Execute.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub capabilities: u64,
    pub compilation_flags: u64,
    pub implicit_limit: u64,
    pub format: IoFormat,
    pub cardinality: Cardinality,
    pub query: String,
    pub state_type_id: Uuid,
    pub state_data: Bytes,
}

impl QueryOptions {
    pub fn new(query: impl Into<String>, cardinality: Cardinality) -> Self {
        Self {
            capabilities: capabilities::DEFAULT,
            compilation_flags: 0,
            implicit_limit: 0,
            format: IoFormat::Binary,
            cardinality,
            query: query.into(),
            state_type_id: Uuid::nil(),
            state_data: Bytes::new(),
        }
    }

    fn encode(&self, body: &mut BytesMut) {
        // No annotations
        body.put_u16(0);
        body.put_u64(self.capabilities);
        body.put_u64(self.compilation_flags);
        body.put_u64(self.implicit_limit);
        body.put_u8(self.format as u8);
        body.put_u8(self.cardinality as u8);
        put_string(body, &self.query);
        body.put_slice(self.state_type_id.as_bytes());
        put_bytes(body, &self.state_data);
    }
}

/// Parse ('P') - describe a query without running it
#[derive(Debug, Clone)]
pub struct Parse {
    pub options: QueryOptions,
}

impl ClientMessage for Parse {
    fn message_type(&self) -> u8 {
        b'P'
    }

    fn encode_body(&self, body: &mut BytesMut) {
        self.options.encode(body);
    }
}

/// Execute ('O') - run a described query with encoded arguments
#[derive(Debug, Clone)]
pub struct Execute {
    pub options: QueryOptions,
    pub input_type_id: Uuid,
    pub output_type_id: Uuid,
    pub arguments: Bytes,
}

impl ClientMessage for Execute {
    fn message_type(&self) -> u8 {
        b'O'
    }

    fn encode_body(&self, body: &mut BytesMut) {
        self.options.encode(body);
        body.put_slice(self.input_type_id.as_bytes());
        body.put_slice(self.output_type_id.as_bytes());
        put_bytes(body, &self.arguments);
    }
}

/// Sync ('S') - end of a request pipeline
#[derive(Debug, Clone, Copy)]
pub struct Sync;

impl ClientMessage for Sync {
    fn message_type(&self) -> u8 {
        b'S'
    }

    fn encode_body(&self, _body: &mut BytesMut) {}
}

/// Flush ('H') - ask the server to flush its output
#[derive(Debug, Clone, Copy)]
pub struct Flush;

impl ClientMessage for Flush {
    fn message_type(&self) -> u8 {
        b'H'
    }

    fn encode_body(&self, _body: &mut BytesMut) {}
}

/// Terminate ('X') - close the session
#[derive(Debug, Clone, Copy)]
pub struct Terminate;

impl ClientMessage for Terminate {
    fn message_type(&self) -> u8 {
        b'X'
    }

    fn encode_body(&self, _body: &mut BytesMut) {}
}

// ============================================================================
// Server -> Client Messages
// ============================================================================

/// Authentication status sub-messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Ok,
    Sasl { methods: Vec<String> },
    SaslContinue { data: Vec<u8> },
    SaslFinal { data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct CommandDataDescription {
    pub annotations: Vec<Annotation>,
    pub capabilities: u64,
    pub result_cardinality: Cardinality,
    pub input_type_id: Uuid,
    pub input_descriptors: Bytes,
    pub output_type_id: Uuid,
    pub output_descriptors: Bytes,
}

#[derive(Debug, Clone)]
pub struct CommandComplete {
    pub annotations: Vec<Annotation>,
    pub capabilities: u64,
    pub status: String,
    pub state_type_id: Uuid,
    pub state_data: Bytes,
}

#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub severity: ErrorSeverity,
    pub code: u32,
    pub message: String,
    pub attributes: Vec<(u16, Vec<u8>)>,
}

impl ErrorResponse {
    pub fn into_error(self) -> EdgeError {
        EdgeError::Server {
            severity: self.severity,
            code: self.code,
            message: self.message,
            attributes: self.attributes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogMessage {
    pub severity: ErrorSeverity,
    pub code: u32,
    pub text: String,
    pub annotations: Vec<Annotation>,
}

/// Decoded server message.
///
/// `Data` is not materialized here: its elements are decoded straight from
/// the packet through the output codec, see [`decode_data`].
#[derive(Debug, Clone)]
pub enum ServerMessage {
    ServerHandshake {
        version: ProtocolVersion,
        extensions: Vec<String>,
    },
    Authentication(Authentication),
    ServerKeyData {
        key: [u8; 32],
    },
    ParameterStatus {
        name: String,
        value: Bytes,
    },
    StateDataDescription {
        type_id: Uuid,
        descriptors: Bytes,
    },
    CommandDataDescription(CommandDataDescription),
    CommandComplete(CommandComplete),
    ReadyForCommand {
        annotations: Vec<Annotation>,
        state: TransactionState,
    },
    ErrorResponse(ErrorResponse),
    LogMessage(LogMessage),
    ParseComplete,
    Data {
        element_count: u16,
    },
    DumpHeader {
        payload: Bytes,
    },
    DumpBlock {
        payload: Bytes,
    },
    RestoreReady {
        jobs: u16,
    },
}

impl ServerMessage {
    /// Decode the body of a received packet.
    pub fn decode(packet: &Packet) -> Result<Self> {
        let mut buf = packet.contract();
        let msg = match packet.message_type() {
            ServerMessageType::ServerHandshake => Self::decode_handshake(&mut buf)?,
            ServerMessageType::Authentication => Self::decode_auth(&mut buf)?,
            ServerMessageType::ServerKeyData => {
                let mut key = [0u8; 32];
                key.copy_from_slice(buf.read_bytes(32)?);
                ServerMessage::ServerKeyData { key }
            }
            ServerMessageType::ParameterStatus => ServerMessage::ParameterStatus {
                name: String::from_utf8_lossy(buf.read_length_prefixed()?).into_owned(),
                value: Bytes::copy_from_slice(buf.read_length_prefixed()?),
            },
            ServerMessageType::StateDataDescription => ServerMessage::StateDataDescription {
                type_id: buf.read_uuid()?,
                descriptors: Bytes::copy_from_slice(buf.read_length_prefixed()?),
            },
            ServerMessageType::CommandDataDescription => Self::decode_data_description(&mut buf)?,
            ServerMessageType::CommandComplete => {
                ServerMessage::CommandComplete(CommandComplete {
                    annotations: read_annotations(&mut buf)?,
                    capabilities: buf.read_u64()?,
                    status: buf.read_string()?,
                    state_type_id: buf.read_uuid()?,
                    state_data: Bytes::copy_from_slice(buf.read_length_prefixed()?),
                })
            }
            ServerMessageType::ReadyForCommand => ServerMessage::ReadyForCommand {
                annotations: read_annotations(&mut buf)?,
                state: TransactionState::try_from(buf.read_u8()?)?,
            },
            ServerMessageType::ErrorResponse => Self::decode_error_response(&mut buf)?,
            ServerMessageType::LogMessage => ServerMessage::LogMessage(LogMessage {
                severity: ErrorSeverity::from(buf.read_u8()?),
                code: buf.read_u32()?,
                text: buf.read_string()?,
                annotations: read_annotations(&mut buf)?,
            }),
            ServerMessageType::ParseComplete => {
                // Legacy body, nothing in it we need
                buf.read_rest()?;
                ServerMessage::ParseComplete
            }
            ServerMessageType::Data => {
                let element_count = buf.read_u16()?;
                buf.read_rest()?;
                ServerMessage::Data { element_count }
            }
            ServerMessageType::DumpHeader => ServerMessage::DumpHeader {
                payload: Bytes::copy_from_slice(buf.read_rest()?),
            },
            ServerMessageType::DumpBlock => ServerMessage::DumpBlock {
                payload: Bytes::copy_from_slice(buf.read_rest()?),
            },
            ServerMessageType::RestoreReady => {
                let _ = read_annotations(&mut buf)?;
                ServerMessage::RestoreReady {
                    jobs: buf.read_u16()?,
                }
            }
        };
        buf.ensure_exhausted("server message")?;
        Ok(msg)
    }

    fn decode_handshake(buf: &mut BufferContract<'_>) -> Result<Self> {
        let version = ProtocolVersion::new(buf.read_u16()?, buf.read_u16()?);
        let count = buf.read_u16()?;
        let mut extensions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            extensions.push(buf.read_string()?);
            let _ = read_annotations(buf)?;
        }
        Ok(ServerMessage::ServerHandshake {
            version,
            extensions,
        })
    }

    fn decode_auth(buf: &mut BufferContract<'_>) -> Result<Self> {
        let status = buf.read_u32()?;
        let auth = match status {
            0 => Authentication::Ok,
            10 => {
                let count = buf.read_u32()?;
                let mut methods = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    methods.push(buf.read_string()?);
                }
                Authentication::Sasl { methods }
            }
            11 => Authentication::SaslContinue {
                data: buf.read_length_prefixed()?.to_vec(),
            },
            12 => Authentication::SaslFinal {
                data: buf.read_length_prefixed()?.to_vec(),
            },
            other => {
                return Err(EdgeError::protocol(format!(
                    "unknown authentication status {}",
                    other
                )))
            }
        };
        Ok(ServerMessage::Authentication(auth))
    }

    fn decode_data_description(buf: &mut BufferContract<'_>) -> Result<Self> {
        Ok(ServerMessage::CommandDataDescription(CommandDataDescription {
            annotations: read_annotations(buf)?,
            capabilities: buf.read_u64()?,
            result_cardinality: Cardinality::try_from(buf.read_u8()?)?,
            input_type_id: buf.read_uuid()?,
            input_descriptors: Bytes::copy_from_slice(buf.read_length_prefixed()?),
            output_type_id: buf.read_uuid()?,
            output_descriptors: Bytes::copy_from_slice(buf.read_length_prefixed()?),
        }))
    }

    fn decode_error_response(buf: &mut BufferContract<'_>) -> Result<Self> {
        let severity = ErrorSeverity::from(buf.read_u8()?);
        let code = buf.read_u32()?;
        let message = buf.read_string()?;
        let count = buf.read_u16()?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = buf.read_u16()?;
            attributes.push((key, buf.read_length_prefixed()?.to_vec()));
        }
        Ok(ServerMessage::ErrorResponse(ErrorResponse {
            severity,
            code,
            message,
            attributes,
        }))
    }
}

/// Decode every element of a Data packet through `codec`.
pub fn decode_data(packet: &Packet, codec: &Codec) -> Result<Vec<Value>> {
    if packet.message_type() != ServerMessageType::Data {
        return Err(EdgeError::protocol(format!(
            "expected Data, got {:?}",
            packet.message_type()
        )));
    }
    let mut buf = packet.contract();
    let count = buf.read_u16()?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = buf.read_u32()? as usize;
        let mut element = buf.reserve(len)?;
        values.push(codec.decode(&mut element)?);
        element.ensure_exhausted("data element")?;
    }
    buf.ensure_exhausted("Data message")?;
    Ok(values)
}

// ============================================================================
// Helper Functions
// ============================================================================

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub(crate) fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn read_annotations(buf: &mut BufferContract<'_>) -> Result<Vec<Annotation>> {
    let count = buf.read_u16()?;
    let mut annotations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        annotations.push((buf.read_string()?, buf.read_string()?));
    }
    Ok(annotations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_are_thread_safe() {
        fn assert_thread_safe<M: Send + std::marker::Sync + ?Sized>() {}
        assert_thread_safe::<dyn ClientMessage>();
        assert_thread_safe::<Sync>();
        assert_thread_safe::<Execute>();
    }

    #[test]
    fn test_sync_message_structure() {
        let encoded = Sync.encode();
        assert_eq!(&encoded[..], &[b'S', 0, 0, 0, 4]);
    }

    #[test]
    fn test_header_length_correction() {
        let header = PacketHeader::parse(&[b'Z', 0, 0, 0, 7]).unwrap();
        assert_eq!(header.message_type, ServerMessageType::ReadyForCommand);
        assert_eq!(header.length, 3);
        assert_eq!(header.wire_len(), 8);

        assert!(PacketHeader::parse(&[b'Z', 0, 0, 0, 3]).is_err());
        assert!(matches!(
            PacketHeader::parse(&[b'?', 0, 0, 0, 4]),
            Err(EdgeError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_parse_message_structure() {
        let msg = Parse {
            options: QueryOptions::new("select 1", Cardinality::Many),
        };
        let encoded = msg.encode();
        assert_eq!(encoded[0], b'P');
        let len = u32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
        assert_eq!(len as usize, encoded.len() - 1);
    }
}

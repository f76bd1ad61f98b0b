//! A single client session over the binary protocol.
//!
//! [`Connection`] drives the handshake, then runs one request pipeline at a
//! time: Parse to learn a query's types, Execute to run it. Codecs are built
//! from the descriptors the server sends and kept in an injectable
//! [`CodecCache`]; parsed type ids go to an LRU [`QueryCache`] so repeated
//! queries skip Parse.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::buffer::{BufferPool, Packet};
use super::builder::CodecCache;
use super::codecs::{CodecRef, NULL_CODEC_ID};
use super::config::ConnectionConfig;
use super::duplexer::Duplexer;
use super::host::{HostType, HostTyped};
use super::protocol::{
    self, capabilities, decode_data, Authentication, Cardinality, ClientHandshake,
    CommandDataDescription, Execute, IoFormat, LogMessage, Parse, ProtocolVersion, QueryOptions,
    SaslInitialResponse, SaslResponse, ServerMessage, ServerMessageType, Terminate,
    TransactionState,
};
use super::query_cache::{QueryCache, QueryKey, QueryTypes};
use super::scram::{ScramClient, SCRAM_SHA_256};
use super::types::Value;
use crate::error::{EdgeError, ErrorSeverity, Result, STATE_MISMATCH_ERROR};

/// Codecs for one parsed query.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub input: CodecRef,
    pub output: CodecRef,
    pub types: QueryTypes,
}

/// Session state echoed back to the server with every request.
#[derive(Debug, Clone)]
struct SessionState {
    type_id: Uuid,
    data: Bytes,
    /// Codec for the state type the server last described.
    codec: Option<CodecRef>,
}

impl SessionState {
    fn initial() -> Self {
        Self {
            type_id: NULL_CODEC_ID,
            data: Bytes::new(),
            codec: None,
        }
    }
}

pub struct Connection<T> {
    duplexer: Duplexer<T>,
    config: ConnectionConfig,
    codecs: Arc<CodecCache>,
    queries: QueryCache,
    version: ProtocolVersion,
    server_key: Option<[u8; 32]>,
    parameters: HashMap<String, Bytes>,
    state: SessionState,
    transaction_state: TransactionState,
    capabilities: u64,
    /// Never cancelled; connection-level calls are cancelled by dropping them.
    cancel: CancellationToken,
}

impl Connection<TcpStream> {
    /// Connect over TCP and authenticate.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let addr = config.address();
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| EdgeError::Timeout(config.connect_timeout))??;
        stream.set_nodelay(true)?;
        tracing::debug!(%addr, "transport connected");
        Self::handshake(stream, config).await
    }

    pub async fn connect_url(url: &str) -> Result<Self> {
        Self::connect(ConnectionConfig::from_url(url)?).await
    }
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the handshake over an already established transport.
    pub async fn handshake(stream: T, config: ConnectionConfig) -> Result<Self> {
        Self::handshake_with_cache(stream, config, Arc::new(CodecCache::new())).await
    }

    /// Like [`handshake`](Self::handshake), sharing `codecs` with other
    /// connections.
    pub async fn handshake_with_cache(
        stream: T,
        config: ConnectionConfig,
        codecs: Arc<CodecCache>,
    ) -> Result<Self> {
        config.validate()?;
        let duplexer = Duplexer::new(stream, Arc::new(BufferPool::default()), config.message_timeout);
        let mut conn = Self {
            duplexer,
            queries: QueryCache::new(config.query_cache_capacity),
            version: config.protocol_version,
            config,
            codecs,
            server_key: None,
            parameters: HashMap::new(),
            state: SessionState::initial(),
            transaction_state: TransactionState::Idle,
            capabilities: capabilities::DEFAULT,
            cancel: CancellationToken::new(),
        };
        conn.startup().await?;
        Ok(conn)
    }

    async fn startup(&mut self) -> Result<()> {
        let mut params = vec![
            ("user".to_string(), self.config.user.clone()),
            ("database".to_string(), self.config.database.clone()),
        ];
        if let Some(key) = &self.config.secret_key {
            params.push(("secret_key".to_string(), key.clone()));
        }
        let handshake = ClientHandshake {
            version: self.config.protocol_version,
            params,
        };
        self.duplexer.send(&[&handshake], &self.cancel).await?;

        loop {
            match self.recv_message().await? {
                ServerMessage::ServerHandshake { version, extensions } => {
                    self.negotiate(version)?;
                    if !extensions.is_empty() {
                        tracing::debug!(?extensions, "server offered protocol extensions");
                    }
                }
                ServerMessage::Authentication(Authentication::Ok) => {}
                ServerMessage::Authentication(Authentication::Sasl { methods }) => {
                    self.authenticate(&methods).await?;
                }
                ServerMessage::ServerKeyData { key } => self.server_key = Some(key),
                ServerMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                ServerMessage::StateDataDescription { type_id, descriptors } => {
                    self.apply_state_description(type_id, &descriptors)?;
                }
                ServerMessage::ReadyForCommand { state, .. } => {
                    self.transaction_state = state;
                    tracing::debug!(version = %self.version, "handshake complete");
                    return Ok(());
                }
                ServerMessage::ErrorResponse(err) => {
                    self.duplexer.disconnect("handshake rejected");
                    return Err(err.into_error());
                }
                ServerMessage::LogMessage(msg) => forward_log(&msg),
                other => {
                    tracing::trace!(message = ?other, "ignoring message during handshake");
                }
            }
        }
    }

    fn negotiate(&mut self, offered: ProtocolVersion) -> Result<()> {
        let requested = self.config.protocol_version;
        if offered.major != requested.major {
            self.duplexer.disconnect("unsupported protocol version");
            return Err(EdgeError::protocol(format!(
                "server offered protocol {}, client speaks {}",
                offered, requested
            )));
        }
        if offered.minor != requested.minor {
            tracing::warn!(%offered, %requested, "protocol minor version mismatch");
        }
        self.version = offered;
        Ok(())
    }

    async fn authenticate(&mut self, methods: &[String]) -> Result<()> {
        if !methods.iter().any(|m| m == SCRAM_SHA_256) {
            return Err(EdgeError::Auth(format!(
                "server requires unsupported SASL mechanisms: {:?}",
                methods
            )));
        }
        let password = self
            .config
            .password
            .as_deref()
            .ok_or_else(|| EdgeError::Auth("password required".to_string()))?;

        let mut scram = ScramClient::new(&self.config.user, password);
        let initial = SaslInitialResponse {
            method: SCRAM_SHA_256.to_string(),
            data: scram.client_first_message(),
        };
        self.duplexer.send(&[&initial], &self.cancel).await?;

        loop {
            match self.recv_message().await? {
                ServerMessage::Authentication(Authentication::SaslContinue { data }) => {
                    let response = SaslResponse {
                        data: scram.process_server_first(&data)?,
                    };
                    self.duplexer.send(&[&response], &self.cancel).await?;
                }
                ServerMessage::Authentication(Authentication::SaslFinal { data }) => {
                    scram.verify_server_final(&data)?;
                    return Ok(());
                }
                ServerMessage::ErrorResponse(err) => return Err(err.into_error()),
                other => {
                    return Err(EdgeError::protocol(format!(
                        "unexpected message during SASL exchange: {:?}",
                        other
                    )))
                }
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn query_key(&self, query: &str, cardinality: Cardinality) -> QueryKey {
        QueryKey::new(query, cardinality, IoFormat::Binary, self.capabilities)
    }

    fn query_options(&self, key: &QueryKey) -> QueryOptions {
        QueryOptions {
            capabilities: key.capabilities,
            format: key.format,
            state_type_id: self.state.type_id,
            state_data: self.state.data.clone(),
            ..QueryOptions::new(key.query.clone(), key.cardinality)
        }
    }

    /// Codecs for `query`, from the caches when possible.
    pub async fn parse(&mut self, query: &str, cardinality: Cardinality) -> Result<Prepared> {
        let key = self.query_key(query, cardinality);
        match self.cached(&key) {
            Some(prepared) => Ok(prepared),
            None => self.parse_uncached(&key).await,
        }
    }

    fn cached(&mut self, key: &QueryKey) -> Option<Prepared> {
        let types = self.queries.get_and_touch(key)?;
        Some(Prepared {
            input: self.codecs.get(&types.input_type_id)?,
            output: self.codecs.get(&types.output_type_id)?,
            types,
        })
    }

    async fn parse_uncached(&mut self, key: &QueryKey) -> Result<Prepared> {
        let parse = Parse {
            options: self.query_options(key),
        };
        self.duplexer.send(&[&parse, &protocol::Sync], &self.cancel).await?;

        let mut prepared = None;
        let mut error = None;
        loop {
            match self.recv_message().await? {
                ServerMessage::CommandDataDescription(desc) => match self.describe(key, &desc) {
                    Ok(p) => prepared = Some(p),
                    Err(e) => self.fail_request(&mut error, e)?,
                },
                ServerMessage::ReadyForCommand { state, .. } => {
                    self.transaction_state = state;
                    break;
                }
                other => self.handle_common(other, &mut error)?,
            }
        }
        if let Some(e) = error {
            return Err(e);
        }
        prepared.ok_or_else(|| EdgeError::protocol("Parse finished without a data description"))
    }

    /// Build codecs for a CommandDataDescription and remember its type ids.
    fn describe(&mut self, key: &QueryKey, desc: &CommandDataDescription) -> Result<Prepared> {
        let input = self
            .codecs
            .build_codec_from_bytes(self.version, desc.input_type_id, &desc.input_descriptors)?;
        let output = self
            .codecs
            .build_codec_from_bytes(self.version, desc.output_type_id, &desc.output_descriptors)?;
        let types = QueryTypes {
            input_type_id: desc.input_type_id,
            output_type_id: desc.output_type_id,
            result_cardinality: desc.result_cardinality,
            capabilities: desc.capabilities,
        };
        self.queries.insert(key.clone(), types);
        Ok(Prepared { input, output, types })
    }

    /// Run `query` with `args`, decoding rows as `host`.
    ///
    /// A state mismatch reported by the server triggers one re-parse and
    /// retry.
    pub async fn execute(
        &mut self,
        query: &str,
        args: &Value,
        cardinality: Cardinality,
        host: &HostType,
    ) -> Result<Vec<Value>> {
        let key = self.query_key(query, cardinality);
        match self.execute_once(&key, args, host).await {
            Err(e) if e.server_code() == Some(STATE_MISMATCH_ERROR) => {
                tracing::debug!(query, "session state descriptor changed, parsing again");
                self.queries.remove(&key);
                self.execute_once(&key, args, host).await
            }
            other => other,
        }
    }

    async fn execute_once(&mut self, key: &QueryKey, args: &Value, host: &HostType) -> Result<Vec<Value>> {
        let prepared = match self.cached(key) {
            Some(prepared) => prepared,
            None => self.parse_uncached(key).await?,
        };
        let arguments = prepared.input.encode_to_bytes(args)?;
        let mut output = self.codecs.specialize(&prepared.output, host)?;

        let execute = Execute {
            options: self.query_options(key),
            input_type_id: prepared.types.input_type_id,
            output_type_id: prepared.types.output_type_id,
            arguments,
        };
        self.duplexer.send(&[&execute, &protocol::Sync], &self.cancel).await?;

        let mut rows = Vec::new();
        let mut error = None;
        loop {
            let packet = self.recv().await?;
            if packet.message_type() == ServerMessageType::Data {
                if error.is_none() {
                    match decode_data(&packet, &output) {
                        Ok(values) => rows.extend(values),
                        Err(e) => self.fail_request(&mut error, e)?,
                    }
                }
                continue;
            }
            match self.decode_message(&packet)? {
                // The server recompiled the query; later Data follows the new shape
                ServerMessage::CommandDataDescription(desc) => {
                    let respecialized = self
                        .describe(key, &desc)
                        .and_then(|p| self.codecs.specialize(&p.output, host));
                    match respecialized {
                        Ok(codec) => output = codec,
                        Err(e) => self.fail_request(&mut error, e)?,
                    }
                }
                ServerMessage::CommandComplete(complete) => {
                    tracing::debug!(status = %complete.status, rows = rows.len(), "command complete");
                    self.state.type_id = complete.state_type_id;
                    self.state.data = complete.state_data;
                }
                ServerMessage::ReadyForCommand { state, .. } => {
                    self.transaction_state = state;
                    break;
                }
                other => self.handle_common(other, &mut error)?,
            }
        }
        match error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    /// Run a query without arguments, decoding rows dynamically.
    pub async fn query(&mut self, query: &str) -> Result<Vec<Value>> {
        self.execute(query, &Value::Nothing, Cardinality::Many, &HostType::Dynamic)
            .await
    }

    /// Run a query decoding every row as `R`.
    pub async fn query_as<R: HostTyped>(&mut self, query: &str, args: &Value) -> Result<Vec<Value>> {
        self.execute(query, args, Cardinality::Many, &R::host_type()).await
    }

    /// Run a query returning at most one row.
    pub async fn query_single(&mut self, query: &str, args: &Value) -> Result<Option<Value>> {
        let rows = self
            .execute(query, args, Cardinality::AtMostOne, &HostType::Dynamic)
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Send Terminate and disconnect.
    pub async fn close(&self) -> Result<()> {
        if !self.duplexer.is_connected() {
            return Ok(());
        }
        let terminated = self.duplexer.send(&[&Terminate], &self.cancel).await;
        let closed = self.duplexer.close().await;
        terminated.and(closed)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn is_closed(&self) -> bool {
        !self.duplexer.is_connected()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transaction_state
    }

    pub fn server_key(&self) -> Option<&[u8; 32]> {
        self.server_key.as_ref()
    }

    pub fn parameter(&self, name: &str) -> Option<&Bytes> {
        self.parameters.get(name)
    }

    pub fn codecs(&self) -> &Arc<CodecCache> {
        &self.codecs
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.queries
    }

    pub fn duplexer(&self) -> &Duplexer<T> {
        &self.duplexer
    }

    /// Codec for the session state type, if the server described one.
    pub fn state_codec(&self) -> Option<&CodecRef> {
        self.state.codec.as_ref()
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    async fn recv(&self) -> Result<Packet> {
        self.duplexer
            .read_next(&self.cancel)
            .await?
            .ok_or_else(|| EdgeError::Disconnected("server closed the connection".to_string()))
    }

    async fn recv_message(&self) -> Result<ServerMessage> {
        let packet = self.recv().await?;
        self.decode_message(&packet)
    }

    fn decode_message(&self, packet: &Packet) -> Result<ServerMessage> {
        ServerMessage::decode(packet).map_err(|e| {
            self.duplexer.disconnect("undecodable server message");
            e
        })
    }

    /// Messages that may arrive in any response.
    fn handle_common(&mut self, msg: ServerMessage, error: &mut Option<EdgeError>) -> Result<()> {
        match msg {
            ServerMessage::ErrorResponse(err) => {
                if error.is_none() {
                    *error = Some(err.into_error());
                }
            }
            ServerMessage::StateDataDescription { type_id, descriptors } => {
                if let Err(e) = self.apply_state_description(type_id, &descriptors) {
                    self.fail_request(error, e)?;
                }
            }
            ServerMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            ServerMessage::LogMessage(msg) => forward_log(&msg),
            ServerMessage::ParseComplete => {}
            other => {
                self.duplexer.disconnect("unexpected message");
                return Err(EdgeError::protocol(format!("unexpected message {:?}", other)));
            }
        }
        Ok(())
    }

    /// Keep the first failure of a request and keep reading to
    /// ReadyForCommand, unless the failure leaves the connection unusable.
    fn fail_request(&self, error: &mut Option<EdgeError>, e: EdgeError) -> Result<()> {
        if e.is_fatal_for_connection() {
            self.duplexer.disconnect("request failed");
            return Err(e);
        }
        if error.is_none() {
            *error = Some(e);
        }
        Ok(())
    }

    fn apply_state_description(&mut self, type_id: Uuid, descriptors: &[u8]) -> Result<()> {
        let codec = self
            .codecs
            .build_codec_from_bytes(self.version, type_id, descriptors)?;
        if self.state.type_id != NULL_CODEC_ID && self.state.type_id != type_id {
            tracing::debug!(old = %self.state.type_id, new = %type_id, "session state type changed");
            self.state.type_id = NULL_CODEC_ID;
            self.state.data = Bytes::new();
        }
        self.state.codec = Some(codec);
        Ok(())
    }
}

/// Forward a server LogMessage at the matching level.
fn forward_log(msg: &LogMessage) {
    match msg.severity {
        ErrorSeverity::Debug => tracing::debug!(code = msg.code, "server: {}", msg.text),
        ErrorSeverity::Info | ErrorSeverity::Notice => {
            tracing::info!(code = msg.code, "server: {}", msg.text)
        }
        ErrorSeverity::Warning => tracing::warn!(code = msg.code, "server: {}", msg.text),
        _ => tracing::error!(code = msg.code, severity = %msg.severity, "server: {}", msg.text),
    }
}

//! Connection establishment and query execution.
//!
//! Implements the client side of the protocol state machine: TCP connect
//! (with an optional proxy-protocol preamble), greeting, optional SSL
//! upgrade, the authentication exchange, and the query/result cycle.

// Packet sizes are protocol-bounded and fit in u32
#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace, warn};

use drizzle_core::error::{
    ConnectionError, ConnectionErrorKind, ProtocolError, QueryError, QueryErrorKind, ServerError,
};
use drizzle_core::{Error, Result, Row, Value};

use crate::auth::{self, AuthPlugin};
use crate::cache::{StatementCache, strip_comments};
use crate::config::MySqlConfig;
use crate::handshake::{self, AuthSwitch, Greeting};
use crate::protocol::batch::write_batch;
use crate::protocol::writer::build_framed;
use crate::protocol::{
    Command, ErrPacket, MAX_PACKET_SIZE, PacketContext, PacketHeader, PacketReader, PacketType,
    PacketWriter, capabilities, server_status,
};
use crate::query::Batch;
use crate::result::{QueryResult, RowSet, UpdateResult, column_info, parse_column_def, parse_text_row};
use crate::tls::{self, TlsStream};
use crate::types::interpolate_params;

/// Connection state in the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Ready,
    InQuery,
    Closed,
}

/// The stream a connection talks over, plain or encrypted. `Detached`
/// only exists while the plain stream is moved out for the TLS wrap.
enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(feature = "tls")]
    Detached,
}

impl Transport {
    /// The underlying socket, for option changes after the handshake.
    fn socket(&self) -> Option<&TcpStream> {
        match self {
            Transport::Plain(s) => Some(s),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => Some(s.get_ref()),
            #[cfg(feature = "tls")]
            Transport::Detached => None,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Transport::Detached => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Transport::Detached => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.flush(),
            #[cfg(feature = "tls")]
            Transport::Detached => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }
}

/// Flags shared between a connection and its cancel handles.
#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    timed_out: AtomicBool,
}

/// A handle that can abort the connection's in-flight query from another
/// thread.
///
/// Aborting opens a second connection and issues `KILL QUERY` against the
/// original connection's thread id. The flag set before the kill decides
/// whether the interrupted query surfaces as [`Error::Cancelled`] or
/// [`Error::TimedOut`].
#[derive(Clone)]
pub struct CancelHandle {
    config: MySqlConfig,
    thread_id: u32,
    state: Arc<CancelState>,
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

impl CancelHandle {
    /// Cancel the in-flight query.
    #[allow(clippy::result_large_err)]
    pub fn cancel(&self) -> Result<()> {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.kill_query()
    }

    /// Cancel the in-flight query because its time limit expired.
    #[allow(clippy::result_large_err)]
    pub fn cancel_due_to_timeout(&self) -> Result<()> {
        self.state.timed_out.store(true, Ordering::SeqCst);
        self.kill_query()
    }

    #[allow(clippy::result_large_err)]
    fn kill_query(&self) -> Result<()> {
        debug!(thread_id = self.thread_id, "killing in-flight query");
        // A fresh connection, since the original is blocked reading
        let mut killer = MySqlConnection::connect(self.config.clone())?;
        killer.execute_query(&format!("KILL QUERY {}", self.thread_id))?;
        killer.close()
    }
}

/// A client connection to a MySQL or Drizzle server.
pub struct MySqlConnection {
    transport: Transport,
    state: ConnectionState,
    config: MySqlConfig,
    sequence_id: u8,
    /// Thread id assigned by the server, the KILL target
    thread_id: u32,
    server_version: String,
    server_capabilities: u32,
    status_flags: u16,
    /// Largest total payload the server accepts, from max_allowed_packet
    max_allowed_packet: u64,
    cancel: Arc<CancelState>,
    statement_cache: Option<Arc<StatementCache>>,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("thread_id", &self.thread_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Connect and authenticate.
    #[allow(clippy::result_large_err)]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        let addr = config.socket_addr();
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Connect,
                    message: format!("failed to resolve '{addr}': {e}"),
                    source: Some(Box::new(e)),
                })
            })?
            .next()
            .ok_or_else(|| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Connect,
                    message: format!("'{addr}' resolved to no addresses"),
                    source: None,
                })
            })?;
        let stream = TcpStream::connect_timeout(&resolved, config.connect_timeout).map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("failed to connect to {addr}: {e}"),
                source: Some(Box::new(e)),
            })
        })?;

        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(config.connect_timeout)).ok();
        stream.set_write_timeout(Some(config.connect_timeout)).ok();

        let mut conn = Self {
            transport: Transport::Plain(stream),
            state: ConnectionState::Connecting,
            config,
            sequence_id: 0,
            thread_id: 0,
            server_version: String::new(),
            server_capabilities: 0,
            status_flags: 0,
            max_allowed_packet: MAX_PACKET_SIZE as u64,
            cancel: Arc::new(CancelState::default()),
            statement_cache: None,
        };

        // The proxy preamble goes out raw, before any packet framing
        if let Some(proxy) = conn.config.proxy_protocol.clone() {
            conn.transport.write_all(proxy.header().as_bytes()).map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Connect,
                    message: format!("failed to send proxy header: {e}"),
                    source: Some(Box::new(e)),
                })
            })?;
        }

        let greeting = conn.read_greeting()?;
        conn.thread_id = greeting.thread_id;
        conn.server_version = greeting.server_version.clone();
        conn.server_capabilities = greeting.capabilities;
        conn.status_flags = greeting.status_flags;
        debug!(
            server_version = %conn.server_version,
            thread_id = conn.thread_id,
            "received server greeting"
        );

        conn.state = ConnectionState::Authenticating;
        conn.authenticate(&greeting)?;
        conn.state = ConnectionState::Ready;
        debug!("authenticated");

        // The connect deadline only governs the handshake; queries may
        // legitimately run longer
        if let Some(socket) = conn.transport.socket() {
            socket.set_read_timeout(None).ok();
            socket.set_write_timeout(None).ok();
        }

        if conn.config.create_db {
            if let Some(db) = conn.config.database.clone() {
                conn.execute_query(&format!("CREATE DATABASE IF NOT EXISTS `{db}`"))?;
                conn.select_db(&db)?;
            }
        }

        // Learn the server-side payload limit; keep the protocol default
        // when the probe fails
        match conn.get_server_variable("max_allowed_packet") {
            Ok(Some(value)) => {
                if let Ok(limit) = value.parse::<u64>() {
                    conn.max_allowed_packet = limit;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("max_allowed_packet probe failed: {e}"),
        }

        Ok(conn)
    }

    /// Attach a shared statement cache used when comment stripping is on.
    pub fn with_statement_cache(mut self, cache: Arc<StatementCache>) -> Self {
        self.statement_cache = Some(cache);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Thread id of this connection on the server.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// The server's payload size limit as probed at connect time.
    pub fn max_allowed_packet(&self) -> u64 {
        self.max_allowed_packet
    }

    /// A handle that can abort this connection's in-flight query.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            config: self.config.clone(),
            thread_id: self.thread_id,
            state: Arc::clone(&self.cancel),
        }
    }

    // Handshake

    #[allow(clippy::result_large_err)]
    fn read_greeting(&mut self) -> Result<Greeting> {
        let payload = self.read_packet()?;
        if payload.first() == Some(&0xFF) {
            let mut reader = PacketReader::new(&payload);
            let err = reader
                .parse_err_packet()
                .ok_or_else(|| protocol_error("malformed pre-handshake error packet"))?;
            return Err(server_error(&err));
        }
        handshake::parse_greeting(&payload)
    }

    #[allow(clippy::result_large_err)]
    fn authenticate(&mut self, greeting: &Greeting) -> Result<()> {
        let mut client_caps = self.config.capability_flags() & greeting.capabilities
            | (self.config.capability_flags() & capabilities::CLIENT_SSL);
        // With create_db the database may not exist yet; select it after
        if self.config.create_db {
            client_caps &= !capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let ssl_active = if self.config.use_ssl {
            tls::require_ssl_support(greeting.capabilities)?;
            let request = tls::build_ssl_request_packet(
                client_caps,
                self.config.max_packet_size,
                self.config.charset,
                self.sequence_id,
            );
            self.transport.write_all(&request).map_err(disconnected)?;
            self.transport.flush().map_err(disconnected)?;
            self.sequence_id = self.sequence_id.wrapping_add(1);
            self.upgrade_to_tls()?;
            true
        } else {
            false
        };

        let mut plugin = AuthPlugin::for_greeting(&greeting.auth_plugin);
        let mut seed = greeting.seed.clone();
        let password = self.config.password.clone().unwrap_or_default();

        let database = if client_caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            self.config.database.clone()
        } else {
            None
        };

        let credential = plugin.initial_scramble(&password, &seed);
        let auth_packet = handshake::build_client_auth(
            client_caps,
            self.config.max_packet_size,
            self.config.charset,
            &self.config.user,
            &credential,
            database.as_deref(),
            plugin.advertised_name(),
        );
        self.write_packet(&auth_packet)?;

        loop {
            let payload = self.read_packet()?;
            if payload.is_empty() {
                return Err(protocol_error("empty authentication response"));
            }

            match PacketType::classify(payload[0], payload.len() as u32, PacketContext::Handshake) {
                PacketType::Ok => {
                    let mut reader = PacketReader::new(&payload);
                    if let Some(ok) = reader.parse_ok_packet() {
                        self.status_flags = ok.status_flags;
                    }
                    return Ok(());
                }
                PacketType::Error => {
                    let mut reader = PacketReader::new(&payload);
                    let err = reader
                        .parse_err_packet()
                        .ok_or_else(|| protocol_error("malformed auth error packet"))?;
                    return Err(auth_error(format!(
                        "authentication failed: {} ({})",
                        err.error_message, err.error_code
                    )));
                }
                PacketType::AuthSwitch => match handshake::parse_auth_switch(&payload[1..]) {
                    AuthSwitch::OldPassword => {
                        trace!("server demanded pre-4.1 credential");
                        plugin = AuthPlugin::Old;
                        let response = auth::scramble_323(&password, &seed);
                        self.write_packet(&response)?;
                    }
                    AuthSwitch::Plugin { name, seed: new_seed } => {
                        trace!(plugin = %name, "auth switch");
                        plugin = AuthPlugin::for_switch(&name)?;
                        seed = new_seed;
                        match plugin.switch_response(&password, &seed, ssl_active) {
                            Some(response) => self.write_packet(&response)?,
                            None => {
                                // sha256 without SSL: RSA key exchange
                                let pem = self.obtain_public_key(plugin)?;
                                let encrypted =
                                    auth::rsa_encrypt_password(&password, &seed, &pem)?;
                                self.write_packet(&encrypted)?;
                            }
                        }
                    }
                },
                PacketType::AuthMoreData if plugin == AuthPlugin::CachingSha2 => {
                    let status = payload.get(1).copied().unwrap_or(0);
                    match status {
                        auth::caching_sha2::FAST_AUTH_SUCCESS => {
                            trace!("caching_sha2 fast auth accepted");
                            // Final OK follows; nothing to send
                        }
                        auth::caching_sha2::PERFORM_FULL_AUTH => {
                            if ssl_active {
                                self.write_packet(&auth::cleartext_password(&password))?;
                            } else {
                                let pem = self.obtain_public_key(plugin)?;
                                let encrypted =
                                    auth::rsa_encrypt_password(&password, &seed, &pem)?;
                                self.write_packet(&encrypted)?;
                            }
                        }
                        other => {
                            return Err(protocol_error(format!(
                                "unexpected caching_sha2 status {other:#04x}"
                            )));
                        }
                    }
                }
                _ => {
                    return Err(protocol_error(format!(
                        "unexpected packet {:#04x} during authentication",
                        payload[0]
                    )));
                }
            }
        }
    }

    /// The RSA public key for sha256-family full auth, from the
    /// configured file or fetched from the server.
    #[allow(clippy::result_large_err)]
    fn obtain_public_key(&mut self, plugin: AuthPlugin) -> Result<Vec<u8>> {
        if let Some(path) = self.config.server_public_key.clone() {
            return std::fs::read(&path).map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Authentication,
                    message: format!(
                        "failed to read server public key '{}': {e}",
                        path.display()
                    ),
                    source: Some(Box::new(e)),
                })
            });
        }

        trace!("requesting RSA public key from server");
        self.write_packet(&[plugin.public_key_request_code()])?;
        let payload = self.read_packet()?;
        match payload.first() {
            Some(0x01) => Ok(payload[1..].to_vec()),
            Some(0xFF) => {
                let mut reader = PacketReader::new(&payload);
                let err = reader
                    .parse_err_packet()
                    .ok_or_else(|| protocol_error("malformed error packet"))?;
                Err(server_error(&err))
            }
            _ => Err(protocol_error("unexpected public key response")),
        }
    }

    #[cfg(feature = "tls")]
    #[allow(clippy::result_large_err)]
    fn upgrade_to_tls(&mut self) -> Result<()> {
        // Detach the plain stream, wrap it, swap back in
        let plain = match std::mem::replace(&mut self.transport, Transport::Detached) {
            Transport::Plain(s) => s,
            other => {
                self.transport = other;
                return Err(protocol_error("connection already encrypted"));
            }
        };
        let tls = TlsStream::new(plain, &self.config)?;
        debug!(version = ?tls.protocol_version(), "SSL established");
        self.transport = Transport::Tls(Box::new(tls));
        Ok(())
    }

    #[cfg(not(feature = "tls"))]
    #[allow(clippy::result_large_err)]
    fn upgrade_to_tls(&mut self) -> Result<()> {
        TlsStream::new((), &self.config).map(|_| ())
    }

    // Query execution

    /// Execute a statement, interpolating `?` placeholders.
    #[allow(clippy::result_large_err)]
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let sql = interpolate_params(sql, params);
        self.execute_query(&sql)
    }

    /// Execute a statement and return its rows, discarding update info.
    #[allow(clippy::result_large_err)]
    pub fn query_rows(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        Ok(self.query(sql, params)?.into_rows())
    }

    /// Execute raw query text.
    #[allow(clippy::result_large_err)]
    pub fn execute_query(&mut self, sql: &str) -> Result<QueryResult> {
        if self.state != ConnectionState::Ready {
            return Err(connection_error("connection not ready for queries"));
        }

        let text = self.prepare_text(sql);

        // Total payload is the command byte plus the query bytes
        if text.len() as u64 + 1 > self.max_allowed_packet {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::PacketTooLarge,
                sql: Some(text.to_string()),
                message: format!(
                    "query of {} bytes exceeds max_allowed_packet ({})",
                    text.len() + 1,
                    self.max_allowed_packet
                ),
                source: None,
            }));
        }

        trace!(bytes = text.len(), "sending query");
        self.state = ConnectionState::InQuery;
        self.sequence_id = 0;

        let mut writer = PacketWriter::with_capacity(text.len() + 1);
        writer.write_u8(Command::Query as u8);
        writer.write_bytes(text.as_bytes());
        let sent = self.write_packet(writer.as_bytes());

        if let Err(e) = sent {
            self.state = ConnectionState::Ready;
            return Err(send_error(&text, e));
        }

        let result = self.read_query_result(Some(&text));
        self.state = ConnectionState::Ready;
        result
    }

    /// Comment stripping, through the shared cache when one is attached.
    fn prepare_text<'a>(&self, sql: &'a str) -> std::borrow::Cow<'a, str> {
        if !self.config.strip_query_comments {
            return std::borrow::Cow::Borrowed(sql);
        }
        match &self.statement_cache {
            Some(cache) => {
                std::borrow::Cow::Owned(cache.get_or_insert_with(sql, || strip_comments(sql)).to_string())
            }
            None => std::borrow::Cow::Owned(strip_comments(sql)),
        }
    }

    /// Read one complete result off the wire.
    #[allow(clippy::result_large_err)]
    fn read_query_result(&mut self, sql: Option<&str>) -> Result<QueryResult> {
        let payload = self.read_packet()?;
        if payload.is_empty() {
            return Err(protocol_error("empty query response"));
        }

        match PacketType::classify(payload[0], payload.len() as u32, PacketContext::ResultSet) {
            PacketType::Ok => {
                let mut reader = PacketReader::new(&payload);
                let ok = reader
                    .parse_ok_packet()
                    .ok_or_else(|| protocol_error("malformed OK packet"))?;
                self.status_flags = ok.status_flags;
                Ok(QueryResult::Update(UpdateResult {
                    affected_rows: ok.affected_rows,
                    insert_id: ok.last_insert_id,
                    warnings: ok.warnings,
                    message: ok.info,
                }))
            }
            PacketType::Error => {
                let mut reader = PacketReader::new(&payload);
                let err = reader
                    .parse_err_packet()
                    .ok_or_else(|| protocol_error("malformed error packet"))?;
                Err(self.map_execution_error(&err))
            }
            PacketType::LocalInfile => Err(Error::Query(QueryError {
                kind: QueryErrorKind::Read,
                sql: sql.map(str::to_string),
                message: "LOCAL INFILE is not supported".to_string(),
                source: None,
            })),
            _ => self.read_row_set(&payload),
        }
    }

    #[allow(clippy::result_large_err)]
    fn read_row_set(&mut self, first_packet: &[u8]) -> Result<QueryResult> {
        let mut reader = PacketReader::new(first_packet);
        let column_count = reader
            .read_lenenc_int()
            .ok_or_else(|| protocol_error("invalid column count"))? as usize;

        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let payload = self.read_packet()?;
            columns.push(parse_column_def(&payload)?);
        }

        // EOF between column definitions and rows
        let payload = self.read_packet()?;
        if payload.first() != Some(&0xFE) {
            return Err(protocol_error("missing end-of-columns terminator"));
        }

        let info = column_info(&columns);
        let mut rows = Vec::new();
        let warnings;
        loop {
            let payload = self.read_packet()?;
            if payload.is_empty() {
                return Err(protocol_error("empty packet in row stream"));
            }

            match PacketType::classify(payload[0], payload.len() as u32, PacketContext::ResultSet) {
                PacketType::Eof => {
                    let mut reader = PacketReader::new(&payload);
                    let eof = reader
                        .parse_eof_packet()
                        .ok_or_else(|| protocol_error("malformed EOF packet"))?;
                    self.status_flags = eof.status_flags;
                    warnings = eof.warnings;
                    break;
                }
                PacketType::Error => {
                    let mut reader = PacketReader::new(&payload);
                    let err = reader
                        .parse_err_packet()
                        .ok_or_else(|| protocol_error("malformed error packet"))?;
                    return Err(self.map_execution_error(&err));
                }
                _ => rows.push(parse_text_row(&payload, &columns, &info)),
            }
        }

        Ok(QueryResult::Rows(RowSet {
            columns,
            rows,
            warnings,
        }))
    }

    /// More results are pending from a multi-statement query.
    pub fn has_more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    /// Read the next result of a multi-statement query, if any.
    #[allow(clippy::result_large_err)]
    pub fn get_more_results(&mut self) -> Result<Option<QueryResult>> {
        if !self.has_more_results() {
            return Ok(None);
        }
        self.read_query_result(None).map(Some)
    }

    /// Execute a batch as one multi-statement command, draining the
    /// queue and reading one result per statement.
    #[allow(clippy::result_large_err)]
    pub fn execute_batch(&mut self, batch: &mut Batch) -> Result<Vec<QueryResult>> {
        if batch.is_empty() {
            return Ok(vec![]);
        }
        if !self.config.allow_multi_queries {
            return Err(connection_error(
                "batches require allow_multi_queries to be enabled",
            ));
        }
        if self.state != ConnectionState::Ready {
            return Err(connection_error("connection not ready for queries"));
        }
        if batch.payload_len() + 1 > self.max_allowed_packet {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::PacketTooLarge,
                sql: None,
                message: format!(
                    "batch of {} bytes exceeds max_allowed_packet ({})",
                    batch.payload_len() + 1,
                    self.max_allowed_packet
                ),
                source: None,
            }));
        }

        debug!(statements = batch.len(), bytes = batch.payload_len(), "executing batch");
        self.state = ConnectionState::InQuery;
        let statements = batch.len();
        let packets = write_batch(batch, &mut self.transport).map_err(|e| {
            self_error_on_send(e)
        });
        let packets = match packets {
            Ok(p) => p,
            Err(e) => {
                self.state = ConnectionState::Ready;
                return Err(e);
            }
        };
        self.sequence_id = (packets & 0xFF) as u8;

        let mut results = Vec::with_capacity(statements);
        let outcome = (|| {
            results.push(self.read_query_result(None)?);
            while self.has_more_results() {
                results.push(self.read_query_result(None)?);
            }
            Ok(())
        })();
        self.state = ConnectionState::Ready;
        outcome.map(|()| results)
    }

    /// Convert a server ERROR on an in-flight query, honoring the cancel
    /// and timeout flags. A kill issued by a cancel handle surfaces as a
    /// server error; the flags tell us it was ours.
    fn map_execution_error(&self, err: &ErrPacket) -> Error {
        if self.cancel.timed_out.swap(false, Ordering::SeqCst) {
            return Error::TimedOut;
        }
        if self.cancel.cancelled.swap(false, Ordering::SeqCst) {
            return Error::Cancelled;
        }
        server_error(err)
    }

    // Utility commands

    /// Check the connection is alive.
    #[allow(clippy::result_large_err)]
    pub fn ping(&mut self) -> Result<()> {
        self.sequence_id = 0;
        self.write_packet(&[Command::Ping as u8])?;
        let payload = self.read_packet()?;
        if payload.first() == Some(&0x00) {
            Ok(())
        } else {
            Err(connection_error("ping failed"))
        }
    }

    /// Switch the default database.
    #[allow(clippy::result_large_err)]
    pub fn select_db(&mut self, database: &str) -> Result<()> {
        self.sequence_id = 0;
        let mut writer = PacketWriter::with_capacity(database.len() + 1);
        writer.write_u8(Command::InitDb as u8);
        writer.write_bytes(database.as_bytes());
        self.write_packet(writer.as_bytes())?;

        let payload = self.read_packet()?;
        match payload.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => {
                let mut reader = PacketReader::new(&payload);
                let err = reader
                    .parse_err_packet()
                    .ok_or_else(|| protocol_error("malformed error packet"))?;
                Err(server_error(&err))
            }
            _ => Err(protocol_error("unexpected response to database switch")),
        }
    }

    /// Read one server variable via `SELECT @@name`.
    #[allow(clippy::result_large_err)]
    pub fn get_server_variable(&mut self, name: &str) -> Result<Option<String>> {
        let result = self.execute_query(&format!("select @@{name}"))?;
        let value = result.rows().first().and_then(|row| {
            let v = row.get(0)?;
            if let Some(s) = v.as_str() {
                Some(s.to_string())
            } else if let Some(n) = v.as_u64() {
                Some(n.to_string())
            } else {
                v.as_i64().map(|n| n.to_string())
            }
        });
        Ok(value)
    }

    /// Ask the server to stream its binlog from the given position.
    ///
    /// After this command the connection stops being a query channel;
    /// read events with [`next_binlog_event`](Self::next_binlog_event).
    #[allow(clippy::result_large_err)]
    pub fn start_binlog_dump(&mut self, position: u32, filename: &str) -> Result<()> {
        self.sequence_id = 0;
        let mut writer = PacketWriter::with_capacity(11 + filename.len());
        writer.write_u8(Command::BinlogDump as u8);
        writer.write_u32_le(position);
        writer.write_u16_le(0); // flags
        writer.write_u32_le(0); // server id
        writer.write_bytes(filename.as_bytes());
        self.write_packet(writer.as_bytes())?;
        debug!(position, filename, "binlog dump started");
        Ok(())
    }

    /// Next binlog event payload, or `None` when the stream ends.
    #[allow(clippy::result_large_err)]
    pub fn next_binlog_event(&mut self) -> Result<Option<Vec<u8>>> {
        let payload = self.read_packet()?;
        match payload.first() {
            // Events arrive as OK-prefixed payloads
            Some(0x00) => Ok(Some(payload[1..].to_vec())),
            Some(0xFE) if payload.len() < 9 => Ok(None),
            Some(0xFF) => {
                let mut reader = PacketReader::new(&payload);
                let err = reader
                    .parse_err_packet()
                    .ok_or_else(|| protocol_error("malformed error packet"))?;
                Err(server_error(&err))
            }
            _ => Err(protocol_error("unexpected packet in binlog stream")),
        }
    }

    /// Close the connection gracefully. Best effort; the server may have
    /// already gone away.
    #[allow(clippy::result_large_err)]
    pub fn close(mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.sequence_id = 0;
        let _ = self.write_packet(&[Command::Quit as u8]);
        self.state = ConnectionState::Closed;
        Ok(())
    }

    // Packet I/O

    /// Read one logical packet, reassembling continuation packets.
    #[allow(clippy::result_large_err)]
    fn read_packet(&mut self) -> Result<Vec<u8>> {
        let (mut payload, len) = self.read_raw_packet()?;

        if len == MAX_PACKET_SIZE {
            loop {
                let (chunk, chunk_len) = self.read_raw_packet()?;
                payload.extend_from_slice(&chunk);
                if chunk_len < MAX_PACKET_SIZE {
                    break;
                }
            }
        }

        Ok(payload)
    }

    #[allow(clippy::result_large_err)]
    fn read_raw_packet(&mut self) -> Result<(Vec<u8>, usize)> {
        let mut header_buf = [0u8; 4];
        self.transport
            .read_exact(&mut header_buf)
            .map_err(disconnected)?;

        let header = PacketHeader::from_bytes(&header_buf);
        let len = header.payload_length as usize;
        self.sequence_id = header.sequence_id.wrapping_add(1);

        let mut payload = vec![0u8; len];
        if len > 0 {
            self.transport
                .read_exact(&mut payload)
                .map_err(disconnected)?;
        }
        Ok((payload, len))
    }

    /// Frame and write one payload, splitting at the packet size limit.
    #[allow(clippy::result_large_err)]
    fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let framed = build_framed(payload, self.sequence_id);
        // One sequence number per chunk, including the terminator chunk
        // a payload landing exactly on the limit gets
        self.sequence_id = self
            .sequence_id
            .wrapping_add(((payload.len() / MAX_PACKET_SIZE) + 1) as u8);

        self.transport.write_all(&framed).map_err(disconnected)?;
        self.transport.flush().map_err(disconnected)?;
        Ok(())
    }
}

// Error helpers

fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: msg.into(),
        raw_data: None,
        source: None,
    })
}

fn auth_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: msg.into(),
        source: None,
    })
}

fn connection_error(msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message: msg.into(),
        source: None,
    })
}

fn disconnected(e: std::io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: format!("connection lost: {e}"),
        source: Some(Box::new(e)),
    })
}

fn server_error(err: &ErrPacket) -> Error {
    Error::Server(ServerError {
        code: err.error_code,
        sql_state: err.sql_state.clone(),
        message: err.error_message.clone(),
    })
}

fn send_error(sql: &str, source: Error) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Send,
        sql: Some(sql.to_string()),
        message: "failed to send query".to_string(),
        source: Some(Box::new(source)),
    })
}

fn self_error_on_send(e: std::io::Error) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Send,
        sql: None,
        message: format!("failed to send batch: {e}"),
        source: Some(Box::new(e)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_helpers() {
        assert!(matches!(protocol_error("x"), Error::Protocol(_)));
        assert!(matches!(auth_error("x"), Error::Connection(_)));
        assert!(matches!(connection_error("x"), Error::Connection(_)));

        let err = server_error(&ErrPacket {
            error_code: 1064,
            sql_state: "42000".to_string(),
            error_message: "syntax".to_string(),
        });
        assert_eq!(err.server_code(), Some(1064));
        assert_eq!(err.sqlstate(), Some("42000"));
    }

    #[test]
    fn test_send_error_carries_sql() {
        let err = send_error("SELECT 1", protocol_error("boom"));
        assert_eq!(err.sql(), Some("SELECT 1"));
    }

    #[test]
    fn test_cancel_state_flags() {
        let state = CancelState::default();
        assert!(!state.cancelled.load(Ordering::SeqCst));
        state.cancelled.store(true, Ordering::SeqCst);
        // swap reads and clears in one step
        assert!(state.cancelled.swap(false, Ordering::SeqCst));
        assert!(!state.cancelled.load(Ordering::SeqCst));
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_detached_transport_rejects_io() {
        let mut transport = Transport::Detached;
        let mut buf = [0u8; 1];
        assert_eq!(
            transport.read(&mut buf).unwrap_err().kind(),
            std::io::ErrorKind::NotConnected
        );
        assert_eq!(
            transport.write(&buf).unwrap_err().kind(),
            std::io::ErrorKind::NotConnected
        );
        assert!(transport.socket().is_none());
    }

    #[test]
    fn test_sequence_advance_per_chunk() {
        // A payload below the limit advances the sequence by one chunk
        assert_eq!(100 / MAX_PACKET_SIZE + 1, 1);
        // A payload exactly at the limit needs the terminator chunk too
        assert_eq!(MAX_PACKET_SIZE / MAX_PACKET_SIZE + 1, 2);
        // One byte over the limit is two chunks
        assert_eq!((MAX_PACKET_SIZE + 1) / MAX_PACKET_SIZE + 1, 2);
    }
}

//! MySQL session driver.
//!
//! A [`MySqlConnection`] owns one authenticated session. Statements are
//! sent with [`send_statement`](MySqlConnection::send_statement) or
//! [`execute_prepared`](MySqlConnection::execute_prepared); their results
//! are then pulled with [`next_result`](MySqlConnection::next_result) and
//! [`fetch_row`](MySqlConnection::fetch_row). Only one statement may be in
//! flight: a new command fails with a usage error until every result of
//! the previous one has been read.
//!
//! Each command gets a time budget (`command_timeout`) charged across all
//! of its socket I/O. When it runs out the driver issues `KILL QUERY` over
//! a side connection, drains what the server still sends, and reports
//! [`Error::Timeout`] with the session intact. A session that cannot be
//! drained is aborted.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use sqlwire_core::error::{ConnectionErrorKind, QueryError, QueryErrorKind};
use sqlwire_core::{Error, Result, Row, Value};

use crate::auth::AuthPlugin;
use crate::charset::{self, Encoding, ServerCharsetCache};
use crate::config::MySqlConfig;
use crate::handshake::{self, AuthState};
use crate::protocol::{
    Command, ErrPacket, MAX_PACKET_SIZE, OkPacket, PacketReader, PacketStream, PacketWriter,
    PreparedStatement, build_stmt_close_packet, build_stmt_execute_packet,
    build_stmt_prepare_packet, capabilities, error_codes, parse_stmt_prepare_ok, server_status,
};
use crate::resultset::{
    ResultHeader, ResultSet, RowCursor, RowFormat, is_result_end, parse_result_header,
    parse_terminator,
};
use crate::transport::{self, Socket, Transport};
use crate::types::{ColumnDef, ColumnPolicy};

/// Upper bound on one LOCAL INFILE data packet.
const INFILE_CHUNK: usize = 64 * 1024;

/// Where the session stands between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No statement in flight
    Ready,
    /// The server owes at least one more result
    PendingResult,
    /// Rows of the current result set are being read
    ReadingRows,
    /// The stream is unusable; the session must be dropped
    Broken,
    Closed,
}

/// A MySQL session over TCP or a unix socket.
pub struct MySqlConnection {
    stream: PacketStream<Transport>,
    config: MySqlConfig,
    policy: ColumnPolicy,
    charsets: Arc<ServerCharsetCache>,
    state: ConnectionState,
    /// Columns of the open result set
    cursor: Option<RowCursor>,
    /// Row encoding of the statement in flight
    format: RowFormat,
    last_sql: Option<String>,
    capabilities: u32,
    status_flags: u16,
    connection_id: u32,
    server_version: String,
    seed: Vec<u8>,
    auth_plugin: AuthPlugin,
    encoding: Encoding,
    database: Option<String>,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("connection_id", &self.connection_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Open a session: connect, negotiate TLS and compression, authenticate.
    #[allow(clippy::result_large_err)]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        Self::connect_with_charsets(config, Arc::new(ServerCharsetCache::new()))
    }

    /// Open a session sharing a server charset cache with its pool.
    #[allow(clippy::result_large_err)]
    #[tracing::instrument(level = "debug", skip_all, fields(host = %config.host, port = config.port))]
    pub fn connect_with_charsets(
        config: MySqlConfig,
        charsets: Arc<ServerCharsetCache>,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.column_policy()?;

        let mut socket = Socket::connect(&config)?;
        socket.reset_budget(Some(config.connect_timeout));
        let stream = PacketStream::new(Transport::Plain(socket));

        let (mut stream, established) =
            handshake::establish(stream, &config).map_err(|err| {
                if transport::is_timeout(&err) {
                    Error::connection(
                        ConnectionErrorKind::Connect,
                        format!("timed out after {:?} while connecting", config.connect_timeout),
                    )
                } else {
                    err
                }
            })?;

        if established.capabilities & capabilities::CLIENT_COMPRESS != 0 {
            stream.enable_compression();
        }
        stream.get_mut().socket_mut().reset_budget(None);

        let encoding = charset::charset_for_collation(config.collation)
            .map_or(Encoding::Utf8, charset::encoding_for_charset);
        let server_collation = u16::from(established.handshake.collation);

        let mut conn = Self {
            stream,
            policy,
            charsets,
            state: ConnectionState::Ready,
            cursor: None,
            format: RowFormat::Text,
            last_sql: None,
            capabilities: established.capabilities,
            status_flags: established.status_flags,
            connection_id: established.handshake.connection_id,
            server_version: established.handshake.server_version,
            seed: established.handshake.seed,
            auth_plugin: established.auth_plugin,
            encoding,
            database: config.database.clone(),
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            config,
        };

        if charset::charset_for_collation(server_collation).is_none() && !conn.charsets.is_loaded()
        {
            conn.load_server_charsets()?;
        }

        tracing::info!(
            connection_id = conn.connection_id,
            server_version = %conn.server_version,
            tls = conn.stream.get_ref().is_tls(),
            compressed = conn.stream.is_compressed(),
            "connected to MySQL"
        );
        Ok(conn)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Ready for a new command.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// The session must be discarded.
    pub fn is_broken(&self) -> bool {
        matches!(self.state, ConnectionState::Broken | ConnectionState::Closed)
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Capabilities both sides agreed on.
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    /// Server status flags from the last OK or EOF packet.
    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn is_compressed(&self) -> bool {
        self.stream.is_compressed()
    }

    pub fn is_tls(&self) -> bool {
        self.stream.get_ref().is_tls()
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// Round-trip COM_PING.
    #[allow(clippy::result_large_err)]
    pub fn ping(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.begin(None);
        let result = self
            .stream
            .write_command(&[Command::Ping as u8])
            .and_then(|()| self.expect_ok().map(drop));
        result.map_err(|err| self.fail(err))
    }

    /// Send COM_QUIT and close the socket.
    #[allow(clippy::result_large_err)]
    pub fn close(mut self) -> Result<()> {
        if self.is_broken() {
            return Ok(());
        }
        let result = self.stream.write_command(&[Command::Quit as u8]);
        self.stream.get_ref().socket().shutdown();
        self.state = ConnectionState::Closed;
        tracing::debug!(connection_id = self.connection_id, "connection closed");
        result
    }

    /// Send a text-protocol statement. Results are read with
    /// [`next_result`](Self::next_result).
    #[allow(clippy::result_large_err)]
    pub fn send_statement(&mut self, sql: &str) -> Result<()> {
        self.ensure_idle()?;
        self.begin(Some(sql));
        self.format = RowFormat::Text;

        let mut writer = PacketWriter::with_capacity(sql.len() + 1);
        writer.write_u8(Command::Query as u8);
        writer.write_string_enc(sql, self.encoding);
        tracing::debug!(sql = %sql, "sending statement");

        match self.stream.write_command(writer.as_bytes()) {
            Ok(()) => {
                self.state = ConnectionState::PendingResult;
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Advance to the next result of the statement in flight, skipping any
    /// unread rows of the current one. `None` once the statement is done.
    ///
    /// `force` reads a result even when none is announced.
    #[allow(clippy::result_large_err)]
    pub fn next_result(&mut self, force: bool) -> Result<Option<ResultSet>> {
        self.ensure_open()?;
        let result = self.read_next_result(force);
        result.map_err(|err| self.fail(err))
    }

    /// Next row of the current result set; `None` at its end.
    #[allow(clippy::result_large_err)]
    pub fn fetch_row(&mut self) -> Result<Option<Row>> {
        self.ensure_open()?;
        let result = self.read_row();
        result.map_err(|err| self.fail(err))
    }

    /// Read and discard whatever the statement in flight still owes.
    #[allow(clippy::result_large_err)]
    pub fn finish_statement(&mut self) -> Result<()> {
        while !self.is_ready() {
            self.next_result(false)?;
        }
        Ok(())
    }

    /// Run a statement and collect the rows of its first result set.
    /// Later results are read and discarded.
    #[allow(clippy::result_large_err)]
    pub fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.send_statement(sql)?;
        self.collect_rows()
    }

    #[allow(clippy::result_large_err)]
    pub fn query_one(&mut self, sql: &str) -> Result<Option<Row>> {
        Ok(self.query(sql)?.into_iter().next())
    }

    /// Run a statement and return the affected rows summed over its
    /// results.
    #[allow(clippy::result_large_err)]
    pub fn execute(&mut self, sql: &str) -> Result<u64> {
        self.send_statement(sql)?;
        let mut affected = 0;
        while let Some(result) = self.next_result(false)? {
            affected += result.affected_rows;
        }
        Ok(affected)
    }

    /// Prepare a statement for the binary protocol.
    #[allow(clippy::result_large_err)]
    pub fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        self.ensure_idle()?;
        self.begin(Some(sql));
        let result = self.prepare_inner(sql);
        result.map_err(|err| self.fail(err))
    }

    /// Execute a prepared statement and return its first result. Further
    /// results and rows are read as for [`send_statement`](Self::send_statement).
    #[allow(clippy::result_large_err)]
    pub fn execute_prepared(
        &mut self,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Result<Option<ResultSet>> {
        self.ensure_idle()?;
        if params.len() != stmt.param_count() {
            return Err(Error::Usage(format!(
                "statement expects {} parameters, got {}",
                stmt.param_count(),
                params.len()
            )));
        }
        self.begin(Some(&stmt.sql));
        self.format = RowFormat::Binary;

        let packet =
            build_stmt_execute_packet(stmt.statement_id, params, self.encoding, self.config.old_guids);
        if let Err(err) = self.stream.write_command(&packet) {
            return Err(self.fail(err));
        }
        self.state = ConnectionState::PendingResult;
        self.next_result(false)
    }

    /// Run a prepared statement and collect the rows of its first result set.
    #[allow(clippy::result_large_err)]
    pub fn query_prepared(
        &mut self,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        if let Some(first) = self.execute_prepared(stmt, params)? {
            if first.has_rows() {
                while let Some(row) = self.fetch_row()? {
                    rows.push(row);
                }
            }
        }
        while self.next_result(false)?.is_some() {}
        Ok(rows)
    }

    /// Release a prepared statement on the server. No reply is sent.
    #[allow(clippy::result_large_err)]
    pub fn close_statement(&mut self, stmt: &PreparedStatement) -> Result<()> {
        self.ensure_idle()?;
        self.begin(None);
        let result = self
            .stream
            .write_command(&build_stmt_close_packet(stmt.statement_id));
        result.map_err(|err| self.fail(err))
    }

    /// Switch the default database with COM_INIT_DB.
    #[allow(clippy::result_large_err)]
    pub fn set_database(&mut self, database: &str) -> Result<()> {
        self.ensure_idle()?;
        self.begin(None);

        let mut writer = PacketWriter::command(Command::InitDb);
        writer.write_string_enc(database, self.encoding);
        let result = self
            .stream
            .write_command(writer.as_bytes())
            .and_then(|()| self.expect_ok().map(drop));
        match result {
            Ok(()) => {
                self.database = Some(database.to_string());
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Clear session state (variables, temporary tables, open
    /// transactions) with COM_RESET_CONNECTION, falling back to
    /// COM_CHANGE_USER on servers that lack it.
    #[allow(clippy::result_large_err)]
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.begin(None);
        let result = self
            .stream
            .write_command(&[Command::ResetConnection as u8])
            .and_then(|()| self.expect_ok().map(drop));
        let result = match result {
            Err(Error::Query(err)) if err.code == Some(error_codes::ER_UNKNOWN_COM_ERROR) => {
                tracing::debug!("COM_RESET_CONNECTION unsupported; using COM_CHANGE_USER");
                self.change_user()
            }
            other => other,
        };
        result.map_err(|err| self.fail(err))
    }

    /// Ask the server to abort the statement running on this session.
    ///
    /// Opens a short-lived side connection bounded by `cancel_timeout` and
    /// sends `KILL QUERY <id>`.
    #[allow(clippy::result_large_err)]
    pub fn cancel_query(&self) -> Result<()> {
        kill_query(&self.config, self.connection_id)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ConnectionState::Broken => Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "connection is broken",
            )),
            ConnectionState::Closed => Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "connection is closed",
            )),
            _ => Ok(()),
        }
    }

    #[allow(clippy::result_large_err)]
    fn ensure_idle(&self) -> Result<()> {
        self.ensure_open()?;
        if self.state == ConnectionState::Ready {
            Ok(())
        } else {
            Err(Error::Usage(
                "a previous result is still open; read it to the end first".to_string(),
            ))
        }
    }

    /// Start a command: fresh sequence, fresh time budget.
    fn begin(&mut self, sql: Option<&str>) {
        self.stream.reset_sequence();
        let timeout = self.config.command_timeout;
        self.stream.get_mut().socket_mut().reset_budget(timeout);
        self.last_sql = sql.map(str::to_string);
        self.warnings = 0;
    }

    fn deprecate_eof(&self) -> bool {
        self.capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0
    }

    /// Route a failed operation: timeouts are cancelled and drained, fatal
    /// errors abort the session.
    fn fail(&mut self, err: Error) -> Error {
        if transport::is_timeout(&err) {
            return self.recover_from_timeout();
        }
        if err.is_fatal() {
            self.abort(&err);
        }
        err
    }

    fn recover_from_timeout(&mut self) -> Error {
        let in_statement = matches!(
            self.state,
            ConnectionState::PendingResult | ConnectionState::ReadingRows
        );
        tracing::warn!(
            connection_id = self.connection_id,
            sql = self.last_sql.as_deref().unwrap_or(""),
            "command timed out"
        );
        if !in_statement {
            let err = Error::connection(
                ConnectionErrorKind::Disconnected,
                "command timed out; the session was closed",
            );
            self.abort(&err);
            return err;
        }

        if let Err(err) = self.cancel_query() {
            tracing::warn!(error = %err, "KILL QUERY failed");
        }
        let cancel_timeout = self.config.cancel_timeout;
        self.stream
            .get_mut()
            .socket_mut()
            .reset_budget(Some(cancel_timeout));

        match self.drain() {
            Ok(()) => {
                tracing::debug!(connection_id = self.connection_id, "drained after timeout");
                Error::Timeout
            }
            Err(drain_err) => {
                let err = Error::connection(
                    ConnectionErrorKind::Disconnected,
                    format!("command timed out and the session could not be drained: {drain_err}"),
                );
                self.abort(&err);
                err
            }
        }
    }

    /// Read and discard everything the statement in flight still owes.
    /// Server errors (the interrupted statement) count as its end.
    #[allow(clippy::result_large_err)]
    fn drain(&mut self) -> Result<()> {
        loop {
            let step = match self.state {
                ConnectionState::ReadingRows => self.read_row().map(drop),
                ConnectionState::PendingResult => self.read_next_result(false).map(drop),
                _ => return Ok(()),
            };
            match step {
                Ok(()) | Err(Error::Query(_)) => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn abort(&mut self, reason: &Error) {
        if self.state != ConnectionState::Broken {
            tracing::warn!(
                connection_id = self.connection_id,
                error = %reason,
                "aborting session"
            );
        }
        self.state = ConnectionState::Broken;
        self.cursor = None;
        self.stream.get_ref().socket().shutdown();
    }

    fn server_error(&self, err: ErrPacket) -> Error {
        err.into_error(self.last_sql.as_deref())
    }

    fn apply_ok(&mut self, ok: &OkPacket) {
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.warnings = ok.warnings;
        self.status_flags = ok.status_flags;
    }

    fn after_result(&mut self) {
        self.state = if self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0 {
            ConnectionState::PendingResult
        } else {
            ConnectionState::Ready
        };
    }

    /// Read a bare OK/ERR reply.
    #[allow(clippy::result_large_err)]
    fn expect_ok(&mut self) -> Result<OkPacket> {
        let header = parse_result_header(self.stream.read_packet()?)?;
        match header {
            ResultHeader::Ok(ok) => {
                self.apply_ok(&ok);
                Ok(ok)
            }
            ResultHeader::Err(err) => Err(self.server_error(err)),
            _ => Err(Error::protocol("expected OK or error packet")),
        }
    }

    #[allow(clippy::result_large_err)]
    fn read_next_result(&mut self, force: bool) -> Result<Option<ResultSet>> {
        while self.state == ConnectionState::ReadingRows {
            self.read_row()?;
        }
        if self.state != ConnectionState::PendingResult {
            if !force {
                return Ok(None);
            }
            self.state = ConnectionState::PendingResult;
        }

        let header = parse_result_header(self.stream.read_packet()?)?;
        match header {
            ResultHeader::Ok(ok) => {
                self.apply_ok(&ok);
                self.after_result();
                Ok(Some(ResultSet::from_ok(ok)))
            }
            ResultHeader::Err(err) => {
                self.state = ConnectionState::Ready;
                Err(self.server_error(err))
            }
            ResultHeader::LocalInfile(file_name) => self.local_infile(&file_name).map(Some),
            ResultHeader::Columns(count) => {
                let columns = self.read_columns(count)?;
                let result = ResultSet::with_columns(columns);
                self.cursor = Some(RowCursor::new(&result, self.format));
                self.state = ConnectionState::ReadingRows;
                Ok(Some(result))
            }
        }
    }

    /// Read `count` column definitions and, without DEPRECATE_EOF, the EOF
    /// that follows them.
    #[allow(clippy::result_large_err)]
    fn read_columns(&mut self, count: u64) -> Result<Vec<ColumnDef>> {
        let mut columns = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let payload = self.stream.read_packet()?;
            let mut def = ColumnDef::parse(payload, self.encoding, &self.policy)?;
            if charset::charset_for_collation(def.charset).is_none() {
                if let Some(name) = self.charsets.cached_collation_charset(def.charset) {
                    def.encoding = charset::encoding_for_charset(&name);
                }
            }
            columns.push(def);
        }
        if count > 0 && !self.deprecate_eof() {
            let payload = self.stream.read_packet()?;
            if !is_result_end(payload, false) {
                return Err(Error::protocol("expected EOF after column definitions"));
            }
        }
        Ok(columns)
    }

    #[allow(clippy::result_large_err)]
    fn read_row(&mut self) -> Result<Option<Row>> {
        if self.state != ConnectionState::ReadingRows {
            return Ok(None);
        }
        let deprecate_eof = self.deprecate_eof();
        let payload = self.stream.read_packet()?;

        if is_result_end(payload, deprecate_eof) {
            let end = parse_terminator(payload, deprecate_eof)?;
            self.warnings = end.warnings;
            self.status_flags = end.status_flags;
            self.cursor = None;
            self.after_result();
            return Ok(None);
        }
        if payload.first() == Some(&0xFF) {
            let err = PacketReader::new(payload)
                .parse_err_packet()
                .ok_or_else(|| Error::protocol("malformed error packet"))?;
            self.cursor = None;
            self.state = ConnectionState::Ready;
            return Err(self.server_error(err));
        }

        let cursor = self
            .cursor
            .as_ref()
            .ok_or_else(|| Error::protocol("row received outside a result set"))?;
        cursor.decode(payload, &self.policy).map(Some)
    }

    #[allow(clippy::result_large_err)]
    fn collect_rows(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        let mut captured = false;
        while let Some(result) = self.next_result(false)? {
            if !result.has_rows() {
                continue;
            }
            while let Some(row) = self.fetch_row()? {
                if !captured {
                    rows.push(row);
                }
            }
            captured = true;
        }
        Ok(rows)
    }

    #[allow(clippy::result_large_err)]
    fn prepare_inner(&mut self, sql: &str) -> Result<PreparedStatement> {
        self.stream
            .write_command(&build_stmt_prepare_packet(sql, self.encoding))?;

        let payload = self.stream.read_packet()?;
        if payload.first() == Some(&0xFF) {
            let err = PacketReader::new(payload)
                .parse_err_packet()
                .ok_or_else(|| Error::protocol("malformed error packet"))?;
            return Err(self.server_error(err));
        }
        let ok = parse_stmt_prepare_ok(payload)
            .ok_or_else(|| Error::protocol("malformed COM_STMT_PREPARE response"))?;
        self.warnings = ok.warnings;

        let params = self.read_columns(u64::from(ok.num_params))?;
        let columns = self.read_columns(u64::from(ok.num_columns))?;
        tracing::debug!(
            statement_id = ok.statement_id,
            params = params.len(),
            columns = columns.len(),
            "prepared statement"
        );
        Ok(PreparedStatement::new(
            ok.statement_id,
            sql.to_string(),
            params,
            columns,
        ))
    }

    /// Re-authenticate as the configured user, which also resets the
    /// session.
    #[allow(clippy::result_large_err)]
    fn change_user(&mut self) -> Result<()> {
        self.begin(None);
        let secure = self.stream.get_ref().is_secure();
        let ctx = handshake::auth_context(&self.config, secure);
        let plugin = self.auth_plugin;
        let auth_response = plugin.scramble(&self.seed, &ctx)?;
        let packet = handshake::build_change_user_packet(
            self.capabilities,
            &self.config.user,
            &auth_response,
            self.database.as_deref(),
            self.config.collation,
            plugin.name(),
            &handshake::connect_attributes(&self.config),
        );
        self.stream.write_command(&packet)?;

        let mut state = AuthState::AwaitingAuthResult;
        let (ok, plugin) = handshake::read_auth_result(
            &mut self.stream,
            plugin,
            self.seed.clone(),
            &ctx,
            &mut state,
        )?;
        self.auth_plugin = plugin;
        self.status_flags = ok.status_flags;
        Ok(())
    }

    /// Answer a LOCAL INFILE request. The empty terminating packet is sent
    /// even when the upload is refused, so the exchange stays in step.
    #[allow(clippy::result_large_err)]
    fn local_infile(&mut self, file_name: &str) -> Result<ResultSet> {
        let upload = self.upload_file(file_name)?;
        self.stream.write_packet(&[])?;

        let header = parse_result_header(self.stream.read_packet()?)?;
        let result = match header {
            ResultHeader::Ok(ok) => {
                self.apply_ok(&ok);
                self.after_result();
                ResultSet::from_ok(ok)
            }
            ResultHeader::Err(err) => {
                self.state = ConnectionState::Ready;
                return Err(self.server_error(err));
            }
            _ => return Err(Error::protocol("expected OK after LOCAL INFILE data")),
        };

        // On refusal the server's reply is consumed; any further results
        // stay pending for the caller.
        let bytes = upload?;
        tracing::debug!(file = %file_name, bytes, "uploaded LOCAL INFILE");
        Ok(result)
    }

    /// Stream `file_name` as data packets. The outer error is a transport
    /// failure; the inner one a refusal reported once the session is back
    /// in step.
    #[allow(clippy::result_large_err)]
    fn upload_file(&mut self, file_name: &str) -> Result<Result<u64>> {
        let mut file = match self.open_infile(file_name) {
            Ok(file) => file,
            Err(refusal) => return Ok(Err(refusal)),
        };

        let chunk = (self.config.max_packet_size as usize)
            .min(MAX_PACKET_SIZE)
            .min(INFILE_CHUNK)
            .max(1);
        let mut buf = vec![0u8; chunk];
        let mut total = 0u64;
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => return Ok(Ok(total)),
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Ok(Err(self.infile_error(format!(
                        "failed reading LOCAL INFILE '{file_name}': {err}"
                    ))));
                }
            };
            self.stream.write_packet(&buf[..n])?;
            total += n as u64;
        }
    }

    fn open_infile(&self, file_name: &str) -> Result<File> {
        if !self.config.local_infile {
            return Err(self.infile_error(format!(
                "server requested LOCAL INFILE '{file_name}' but local_infile is disabled"
            )));
        }

        let mut path = PathBuf::from(file_name);
        if let Some(dir) = &self.config.local_infile_dir {
            if path.is_relative() {
                path = dir.join(path);
            }
            let allowed = dir
                .canonicalize()
                .ok()
                .zip(path.canonicalize().ok())
                .is_some_and(|(dir, path)| path.starts_with(dir));
            if !allowed {
                return Err(self.infile_error(format!(
                    "LOCAL INFILE '{file_name}' is outside {}",
                    dir.display()
                )));
            }
        }

        File::open(&path).map_err(|err| {
            self.infile_error(format!("cannot open LOCAL INFILE '{file_name}': {err}"))
        })
    }

    fn infile_error(&self, message: String) -> Error {
        Error::Query(QueryError {
            kind: QueryErrorKind::Permission,
            sql: self.last_sql.clone(),
            code: None,
            sqlstate: None,
            message,
            source: None,
        })
    }

    /// Fill the shared charset cache from `SHOW COLLATION` and
    /// `SHOW CHARACTER SET`.
    #[allow(clippy::result_large_err)]
    fn load_server_charsets(&mut self) -> Result<()> {
        let mut collations = HashMap::new();
        for row in self.query("SHOW COLLATION")? {
            if let (Some(charset), Some(id)) = (cell_str(&row, 1), cell_u64(&row, 2)) {
                if let Ok(id) = u16::try_from(id) {
                    collations.insert(id, charset.to_string());
                }
            }
        }

        let mut max_lengths = HashMap::new();
        for row in self.query("SHOW CHARACTER SET")? {
            if let (Some(charset), Some(max_len)) = (cell_str(&row, 0), cell_u64(&row, 3)) {
                max_lengths.insert(charset.to_string(), max_len.min(u64::from(u8::MAX)) as u8);
            }
        }

        tracing::debug!(
            collations = collations.len(),
            charsets = max_lengths.len(),
            "loaded server charsets"
        );
        let charsets = Arc::clone(&self.charsets);
        charsets.collation_charset(0, move || Ok(collations))?;
        charsets.max_length("", move || Ok(max_lengths))?;
        Ok(())
    }
}

fn cell_str(row: &Row, index: usize) -> Option<&str> {
    row.get(index)?.as_str()
}

fn cell_u64(row: &Row, index: usize) -> Option<u64> {
    let value = row.get(index)?;
    value.as_u64().or_else(|| value.as_str()?.parse().ok())
}

/// Send `KILL QUERY <id>` over a fresh session bounded by the cancel
/// timeout.
///
/// The side session has no command timeout of its own: the KILL round trip
/// runs on a raw budget, so a stalled KILL fails instead of being cancelled
/// in turn.
#[allow(clippy::result_large_err)]
fn kill_query(config: &MySqlConfig, connection_id: u32) -> Result<()> {
    let mut side = config.clone();
    side.pooling = false;
    side.database = None;
    side.connect_timeout = config.cancel_timeout;
    side.command_timeout = None;

    let mut conn = MySqlConnection::connect(side)?;
    tracing::debug!(connection_id, via = conn.connection_id, "sending KILL QUERY");

    conn.stream.reset_sequence();
    conn.stream
        .get_mut()
        .socket_mut()
        .reset_budget(Some(config.cancel_timeout));
    let mut writer = PacketWriter::new();
    writer.write_u8(Command::Query as u8);
    writer.write_bytes(format!("KILL QUERY {connection_id}").as_bytes());
    let result = conn
        .stream
        .write_command(writer.as_bytes())
        .and_then(|()| conn.expect_ok().map(drop));

    if result.is_err() {
        conn.state = ConnectionState::Broken;
        conn.stream.get_ref().socket().shutdown();
        return result;
    }
    conn.close()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_helpers() {
        let info = Arc::new(sqlwire_core::ColumnInfo::new(vec![
            "Collation".into(),
            "Charset".into(),
            "Id".into(),
        ]));
        let row = Row::with_columns(
            info,
            vec![
                Value::Text("utf8mb4_bin".into()),
                Value::Text("utf8mb4".into()),
                Value::Text("46".into()),
            ],
        );
        assert_eq!(cell_str(&row, 1), Some("utf8mb4"));
        assert_eq!(cell_u64(&row, 2), Some(46));
        assert_eq!(cell_u64(&row, 0), None);
        assert_eq!(cell_u64(&row, 9), None);
    }

    #[test]
    fn test_connect_refused_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = MySqlConfig::new()
            .host("127.0.0.1")
            .port(port)
            .user("root")
            .connect_timeout(std::time::Duration::from_millis(500));
        let err = MySqlConnection::connect(config).unwrap_err();
        assert!(err.is_connection_error(), "{err:?}");
    }
}

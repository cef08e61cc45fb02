//! In-process MySQL server for driver tests.
//!
//! Speaks protocol version 10 over a loopback listener: greeting,
//! handshake response, native / caching_sha2 / switch authentication and
//! optionally the compressed envelope. Each test supplies a handler for
//! the commands it cares about; ping, quit, init-db, reset and change-user
//! are answered here.

#![allow(dead_code, clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use sqlwire_mysql::MySqlConfig;
use sqlwire_mysql::auth::{caching_sha2_password, mysql_native_password};
use sqlwire_mysql::protocol::capabilities::*;
use sqlwire_mysql::protocol::server_status::{
    SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_AUTOCOMMIT,
};

pub const SEED: &[u8; 20] = b"0123456789abcdefghij";
pub const SWITCH_SEED: &[u8; 20] = b"ABCDEFGHIJ0123456789";
pub const PASSWORD: &str = "secret";

pub const TYPE_LONGLONG: u8 = 0x08;
pub const TYPE_VAR_STRING: u8 = 0xFD;
pub const BINARY_COLLATION: u16 = 63;
pub const UTF8MB4_COLLATION: u16 = 45;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Native,
    /// Greet with caching_sha2_password, then switch to native
    SwitchToNative,
    /// caching_sha2_password answered with fast-auth success
    CachingFast,
    /// Refuse every login with this error code
    Reject(u16),
}

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub capabilities: u32,
    pub auth: AuthMode,
    pub reset_supported: bool,
    pub collation: u8,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            capabilities: DEFAULT_CLIENT_FLAGS
                | CLIENT_CONNECT_WITH_DB
                | CLIENT_CONNECT_ATTRS
                | CLIENT_LOCAL_FILES
                | CLIENT_MULTI_STATEMENTS
                | CLIENT_FOUND_ROWS
                | CLIENT_COMPRESS,
            auth: AuthMode::Native,
            reset_supported: true,
            collation: UTF8MB4_COLLATION as u8,
        }
    }
}

impl MockOptions {
    pub fn without(mut self, flag: u32) -> Self {
        self.capabilities &= !flag;
        self
    }

    pub fn auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    pub fn no_reset(mut self) -> Self {
        self.reset_supported = false;
        self
    }

    pub fn collation(mut self, id: u8) -> Self {
        self.collation = id;
        self
    }
}

/// What a client sent in its handshake response.
#[derive(Debug, Clone)]
pub struct Login {
    pub connection_id: u32,
    pub capabilities: u32,
    pub user: String,
    pub database: Option<String>,
    pub auth_plugin: String,
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Journal {
    logins: Vec<Login>,
    commands: Vec<(u32, Vec<u8>)>,
}

type Handler = dyn Fn(&mut Session, &[u8]) -> io::Result<()> + Send + Sync;

/// A listening mock server. Each accepted socket is served on its own
/// thread for the lifetime of the test process.
pub struct MockServer {
    addr: SocketAddr,
    journal: Arc<Mutex<Journal>>,
}

impl MockServer {
    pub fn start<F>(options: MockOptions, handler: F) -> Self
    where
        F: Fn(&mut Session, &[u8]) -> io::Result<()> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let handler: Arc<Handler> = Arc::new(handler);
        let journal = Arc::new(Mutex::new(Journal::default()));
        let ids = Arc::new(AtomicU32::new(100));

        let shared = Arc::clone(&journal);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let id = ids.fetch_add(1, Ordering::SeqCst);
                let options = options.clone();
                let handler = Arc::clone(&handler);
                let journal = Arc::clone(&shared);
                thread::spawn(move || {
                    let mut session = Session::new(stream, id, options, journal);
                    let _ = session.serve(&*handler);
                });
            }
        });

        Self { addr, journal }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Client configuration pointing at this server.
    pub fn config(&self) -> MySqlConfig {
        MySqlConfig::new()
            .host("127.0.0.1")
            .port(self.port())
            .user("app")
            .password(PASSWORD)
            .pooling(false)
            .connect_timeout(Duration::from_secs(5))
            .command_timeout(Duration::from_secs(5))
    }

    pub fn logins(&self) -> Vec<Login> {
        self.journal.lock().unwrap().logins.clone()
    }

    /// Raw command payloads in arrival order, with the connection id.
    pub fn commands(&self) -> Vec<(u32, Vec<u8>)> {
        self.journal.lock().unwrap().commands.clone()
    }

    /// Text of every COM_QUERY received.
    pub fn queries(&self) -> Vec<String> {
        self.commands()
            .iter()
            .filter_map(|(_, payload)| query_text(payload).map(str::to_string))
            .collect()
    }

    pub fn command_bytes(&self) -> Vec<u8> {
        self.commands()
            .iter()
            .filter_map(|(_, payload)| payload.first().copied())
            .collect()
    }
}

/// SQL text of a COM_QUERY payload.
pub fn query_text(payload: &[u8]) -> Option<&str> {
    match payload {
        [0x03, sql @ ..] => std::str::from_utf8(sql).ok(),
        _ => None,
    }
}

/// Column definition sent by the mock.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub field_type: u8,
    pub collation: u16,
    pub flags: u16,
}

impl Column {
    pub fn bigint(name: &'static str) -> Self {
        Self {
            name,
            field_type: TYPE_LONGLONG,
            collation: BINARY_COLLATION,
            flags: 0,
        }
    }

    pub fn text(name: &'static str) -> Self {
        Self {
            name,
            field_type: TYPE_VAR_STRING,
            collation: UTF8MB4_COLLATION,
            flags: 0,
        }
    }

    pub fn with_collation(mut self, collation: u16) -> Self {
        self.collation = collation;
        self
    }
}

/// Server side of one client connection.
pub struct Session {
    stream: TcpStream,
    pub id: u32,
    options: MockOptions,
    journal: Arc<Mutex<Journal>>,
    /// Capabilities both sides agreed on
    pub capabilities: u32,
    seq: u8,
    compressed: bool,
    comp_seq: u8,
    inbound: Vec<u8>,
    out: Vec<u8>,
}

impl Session {
    fn new(stream: TcpStream, id: u32, options: MockOptions, journal: Arc<Mutex<Journal>>) -> Self {
        Self {
            stream,
            id,
            options,
            journal,
            capabilities: 0,
            seq: 0,
            compressed: false,
            comp_seq: 0,
            inbound: Vec::new(),
            out: Vec::new(),
        }
    }

    fn serve(&mut self, handler: &Handler) -> io::Result<()> {
        if !self.handshake()? {
            return Ok(());
        }
        loop {
            let payload = self.read_packet()?;
            self.journal
                .lock()
                .unwrap()
                .commands
                .push((self.id, payload.clone()));
            match payload.first().copied() {
                Some(0x01) => return Ok(()),
                Some(0x02 | 0x0E | 0x11) => self.write_ok(0, 0),
                Some(0x1F) if self.options.reset_supported => self.write_ok(0, 0),
                Some(0x1F) => self.write_err(1047, "08S01", "Unknown command"),
                _ => handler(self, &payload)?,
            }
            self.flush()?;
        }
    }

    fn handshake(&mut self) -> io::Result<bool> {
        let greeting_plugin = match self.options.auth {
            AuthMode::SwitchToNative | AuthMode::CachingFast => "caching_sha2_password",
            _ => "mysql_native_password",
        };
        let caps = self.options.capabilities;
        let mut greeting = vec![10];
        greeting.extend_from_slice(b"8.0.36-mock\0");
        greeting.extend_from_slice(&self.id.to_le_bytes());
        greeting.extend_from_slice(&SEED[..8]);
        greeting.push(0);
        greeting.extend_from_slice(&(caps as u16).to_le_bytes());
        greeting.push(self.options.collation);
        greeting.extend_from_slice(&SERVER_STATUS_AUTOCOMMIT.to_le_bytes());
        greeting.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        greeting.push(21);
        greeting.extend_from_slice(&[0; 10]);
        greeting.extend_from_slice(&SEED[8..]);
        greeting.push(0);
        greeting.extend_from_slice(greeting_plugin.as_bytes());
        greeting.push(0);
        self.write_packet(&greeting);
        self.flush()?;

        let response = self.read_packet()?;
        let login = parse_login(self.id, &response)?;
        self.capabilities = login.capabilities & caps;
        let auth_response = login_auth_response(&response)?;
        self.journal.lock().unwrap().logins.push(login);

        let accepted = match self.options.auth {
            AuthMode::Reject(code) => {
                self.write_err(code, "28000", "Access denied");
                false
            }
            AuthMode::Native => auth_response == mysql_native_password(PASSWORD, SEED),
            AuthMode::CachingFast => {
                let ok = auth_response == caching_sha2_password(PASSWORD, SEED);
                if ok {
                    self.write_packet(&[0x01, 0x03]);
                }
                ok
            }
            AuthMode::SwitchToNative => {
                let mut switch = vec![0xFE];
                switch.extend_from_slice(b"mysql_native_password\0");
                switch.extend_from_slice(SWITCH_SEED);
                switch.push(0);
                self.write_packet(&switch);
                self.flush()?;
                self.read_packet()? == mysql_native_password(PASSWORD, SWITCH_SEED)
            }
        };

        if matches!(self.options.auth, AuthMode::Reject(_)) {
            self.flush()?;
            return Ok(false);
        }
        if !accepted {
            self.write_err(1045, "28000", "Access denied for user 'app'");
            self.flush()?;
            return Ok(false);
        }
        self.write_ok(0, 0);
        self.flush()?;
        self.compressed = self.capabilities & CLIENT_COMPRESS != 0;
        Ok(true)
    }

    pub fn deprecate_eof(&self) -> bool {
        self.capabilities & CLIENT_DEPRECATE_EOF != 0
    }

    fn read_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        if !self.compressed {
            let mut buf = vec![0; n];
            self.stream.read_exact(&mut buf)?;
            return Ok(buf);
        }
        while self.inbound.len() < n {
            let mut header = [0u8; 7];
            self.stream.read_exact(&mut header)?;
            let body_len = u24(&header[..3]);
            self.comp_seq = header[3].wrapping_add(1);
            let raw_len = u24(&header[4..]);
            let mut body = vec![0; body_len];
            self.stream.read_exact(&mut body)?;
            if raw_len == 0 {
                self.inbound.extend_from_slice(&body);
            } else {
                ZlibDecoder::new(body.as_slice()).read_to_end(&mut self.inbound)?;
            }
        }
        Ok(self.inbound.drain(..n).collect())
    }

    /// Read one client packet; replies continue its sequence.
    pub fn read_packet(&mut self) -> io::Result<Vec<u8>> {
        let header = self.read_bytes(4)?;
        self.seq = header[3].wrapping_add(1);
        self.read_bytes(u24(&header[..3]))
    }

    /// Queue one packet; it is sent by the next [`flush`](Self::flush).
    pub fn write_packet(&mut self, payload: &[u8]) {
        self.out
            .extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        self.out.push(self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.out.extend_from_slice(payload);
    }

    pub fn flush(&mut self) -> io::Result<()> {
        let out = std::mem::take(&mut self.out);
        if out.is_empty() {
            return Ok(());
        }
        if !self.compressed {
            return self.stream.write_all(&out);
        }
        let (body, raw_len) = if out.len() >= 50 {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&out)?;
            (encoder.finish()?, out.len())
        } else {
            (out, 0)
        };
        let mut frame = Vec::with_capacity(body.len() + 7);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes()[..3]);
        frame.push(self.comp_seq);
        frame.extend_from_slice(&(raw_len as u32).to_le_bytes()[..3]);
        frame.extend_from_slice(&body);
        self.comp_seq = self.comp_seq.wrapping_add(1);
        self.stream.write_all(&frame)
    }

    pub fn write_ok(&mut self, affected_rows: u64, last_insert_id: u64) {
        self.write_ok_status(affected_rows, last_insert_id, SERVER_STATUS_AUTOCOMMIT);
    }

    pub fn write_ok_status(&mut self, affected_rows: u64, last_insert_id: u64, status: u16) {
        let mut ok = vec![0x00];
        put_lenenc(&mut ok, affected_rows);
        put_lenenc(&mut ok, last_insert_id);
        ok.extend_from_slice(&status.to_le_bytes());
        ok.extend_from_slice(&0u16.to_le_bytes());
        self.write_packet(&ok);
    }

    pub fn write_err(&mut self, code: u16, sqlstate: &str, message: &str) {
        let mut err = vec![0xFF];
        err.extend_from_slice(&code.to_le_bytes());
        err.push(b'#');
        err.extend_from_slice(sqlstate.as_bytes());
        err.extend_from_slice(message.as_bytes());
        self.write_packet(&err);
    }

    /// End of a row stream, or of column definitions without
    /// DEPRECATE_EOF.
    pub fn write_eof(&mut self, status: u16) {
        if self.deprecate_eof() {
            let mut ok = vec![0xFE, 0, 0];
            ok.extend_from_slice(&status.to_le_bytes());
            ok.extend_from_slice(&0u16.to_le_bytes());
            self.write_packet(&ok);
        } else {
            self.write_classic_eof(status);
        }
    }

    fn write_classic_eof(&mut self, status: u16) {
        let mut eof = vec![0xFE];
        eof.extend_from_slice(&0u16.to_le_bytes());
        eof.extend_from_slice(&status.to_le_bytes());
        self.write_packet(&eof);
    }

    pub fn write_column(&mut self, column: &Column) {
        let mut def = Vec::new();
        for part in ["def", "mock", "t", "t"] {
            put_lenenc_bytes(&mut def, part.as_bytes());
        }
        put_lenenc_bytes(&mut def, column.name.as_bytes());
        put_lenenc_bytes(&mut def, column.name.as_bytes());
        def.push(0x0C);
        def.extend_from_slice(&column.collation.to_le_bytes());
        def.extend_from_slice(&255u32.to_le_bytes());
        def.push(column.field_type);
        def.extend_from_slice(&column.flags.to_le_bytes());
        def.push(0);
        def.extend_from_slice(&[0, 0]);
        self.write_packet(&def);
    }

    /// Column count, definitions, and the EOF that follows them when
    /// DEPRECATE_EOF is off.
    pub fn write_columns(&mut self, columns: &[Column]) {
        let mut count = Vec::new();
        put_lenenc(&mut count, columns.len() as u64);
        self.write_packet(&count);
        self.write_column_defs(columns);
    }

    pub fn write_column_defs(&mut self, columns: &[Column]) {
        for column in columns {
            self.write_column(column);
        }
        if !columns.is_empty() && !self.deprecate_eof() {
            self.write_classic_eof(SERVER_STATUS_AUTOCOMMIT);
        }
    }

    pub fn write_text_row(&mut self, values: &[Option<&[u8]>]) {
        let mut row = Vec::new();
        for value in values {
            match value {
                Some(bytes) => put_lenenc_bytes(&mut row, bytes),
                None => row.push(0xFB),
            }
        }
        self.write_packet(&row);
    }

    /// A complete text result set. `more` sets MORE_RESULTS_EXISTS on its
    /// terminator.
    pub fn write_result_set(&mut self, columns: &[Column], rows: &[&[Option<&str>]], more: bool) {
        self.write_columns(columns);
        for row in rows {
            let values: Vec<Option<&[u8]>> = row.iter().map(|v| v.map(str::as_bytes)).collect();
            self.write_text_row(&values);
        }
        let mut status = SERVER_STATUS_AUTOCOMMIT;
        if more {
            status |= SERVER_MORE_RESULTS_EXISTS;
        }
        self.write_eof(status);
    }
}

fn u24(bytes: &[u8]) -> usize {
    usize::from(bytes[0]) | usize::from(bytes[1]) << 8 | usize::from(bytes[2]) << 16
}

pub fn put_lenenc(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=250 => out.push(value as u8),
        251..=0xFFFF => {
            out.push(0xFC);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFF_FFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(0xFE);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

pub fn put_lenenc_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_lenenc(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Cursor over a client payload.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        let end = self.pos + n;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short client packet"))?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> io::Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn lenenc(&mut self) -> io::Result<u64> {
        let value = match self.u8()? {
            0xFC => {
                let b = self.take(2)?;
                u64::from(u16::from_le_bytes([b[0], b[1]]))
            }
            0xFD => {
                let b = self.take(3)?;
                u24(b) as u64
            }
            0xFE => {
                let b = self.take(8)?;
                u64::from_le_bytes(b.try_into().unwrap_or_default())
            }
            n => u64::from(n),
        };
        Ok(value)
    }

    fn lenenc_bytes(&mut self) -> io::Result<&'a [u8]> {
        let len = self.lenenc()? as usize;
        self.take(len)
    }

    fn null_str(&mut self) -> io::Result<String> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        self.pos += end + 1;
        Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
    }

    fn remaining(&self) -> bool {
        self.pos < self.data.len()
    }
}

fn parse_login(connection_id: u32, payload: &[u8]) -> io::Result<Login> {
    let mut cur = Cursor::new(payload);
    let capabilities = cur.u32()?;
    cur.u32()?;
    cur.u8()?;
    cur.take(23)?;
    let user = cur.null_str()?;
    skip_auth_response(&mut cur, capabilities)?;
    let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        Some(cur.null_str()?).filter(|db| !db.is_empty())
    } else {
        None
    };
    let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
        cur.null_str()?
    } else {
        String::new()
    };
    let mut attributes = Vec::new();
    if capabilities & CLIENT_CONNECT_ATTRS != 0 && cur.remaining() {
        let block = cur.lenenc_bytes()?;
        let mut attrs = Cursor::new(block);
        while attrs.remaining() {
            let key = String::from_utf8_lossy(attrs.lenenc_bytes()?).into_owned();
            let value = String::from_utf8_lossy(attrs.lenenc_bytes()?).into_owned();
            attributes.push((key, value));
        }
    }
    Ok(Login {
        connection_id,
        capabilities,
        user,
        database,
        auth_plugin,
        attributes,
    })
}

fn skip_auth_response<'a>(cur: &mut Cursor<'a>, capabilities: u32) -> io::Result<&'a [u8]> {
    if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        cur.lenenc_bytes()
    } else {
        let len = cur.u8()?;
        cur.take(usize::from(len))
    }
}

fn login_auth_response(payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut cur = Cursor::new(payload);
    let capabilities = cur.u32()?;
    cur.take(4 + 1 + 23)?;
    cur.null_str()?;
    Ok(skip_auth_response(&mut cur, capabilities)?.to_vec())
}

/// Statement id and the single BIGINT parameter of a COM_STMT_EXECUTE.
pub fn parse_execute_bigint(payload: &[u8]) -> io::Result<(u32, Option<i64>)> {
    let mut cur = Cursor::new(payload);
    cur.u8()?;
    let statement_id = cur.u32()?;
    cur.u8()?;
    cur.u32()?;
    let null_bitmap = cur.u8()?;
    let bound = cur.u8()?;
    if bound == 1 {
        cur.take(2)?;
    }
    if null_bitmap & 1 != 0 {
        return Ok((statement_id, None));
    }
    let b = cur.take(8)?;
    let value = i64::from_le_bytes(b.try_into().unwrap_or_default());
    Ok((statement_id, Some(value)))
}

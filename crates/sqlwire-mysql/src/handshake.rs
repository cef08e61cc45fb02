//! Connection phase: server greeting, optional TLS upgrade, authentication.
//!
//! ```text
//! server                         client
//!   | -- initial handshake (10) -> |
//!   | <- SSL request (optional) -- |   then TLS
//!   | <- handshake response ------ |
//!   | -- auth switch / more data ->|   repeated as the plugin needs
//!   | -- OK | ERR ---------------> |
//! ```

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};

use sqlwire_core::error::ConnectionErrorKind;
use sqlwire_core::{Error, Result};

use crate::auth::{AuthContext, AuthPlugin, AuthStep, plugins};
use crate::config::MySqlConfig;
use crate::protocol::error_codes;
use crate::protocol::{
    Command, OkPacket, PacketReader, PacketStream, PacketWriter, capabilities,
};
use crate::tls::{self, TlsStream};
use crate::transport::Transport;

/// Where the connection phase stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Waiting for the server greeting
    AwaitingHandshake,
    /// Greeting parsed; intersecting capabilities with the configuration
    NegotiatingCapabilities,
    /// SSL request sent, TLS handshake in progress
    SslUpgrade,
    /// Handshake response sent, waiting for the verdict
    AwaitingAuthResult,
    /// Server asked for a different plugin
    AuthSwitch,
    /// Plugin-specific round trip in progress
    MoreData,
    Authenticated,
}

/// The server's protocol-10 greeting.
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Auth plugin data, both parts joined, trailing NUL removed
    pub seed: Vec<u8>,
    pub capabilities: u32,
    pub collation: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Parse the greeting. An ERR packet here (too many connections, host
    /// blocked) becomes a connection error.
    #[allow(clippy::result_large_err)]
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);

        if reader.peek() == Some(0xFF) {
            let err = reader
                .parse_err_packet()
                .ok_or_else(|| Error::protocol("malformed error packet in server greeting"))?;
            return Err(Error::connection(
                ConnectionErrorKind::Connect,
                format!(
                    "server refused connection: {} ({})",
                    err.error_message, err.error_code
                ),
            ));
        }

        let protocol_version = reader
            .read_u8()
            .ok_or_else(|| Error::protocol("missing protocol version"))?;
        if protocol_version != 10 {
            return Err(Error::protocol(format!(
                "unsupported protocol version: {protocol_version}"
            )));
        }

        let server_version = reader.read_null_string();
        let connection_id = reader
            .read_u32_le()
            .ok_or_else(|| Error::protocol("missing connection id"))?;
        let part1 = reader
            .read_bytes(8)
            .ok_or_else(|| Error::protocol("missing auth plugin data"))?;
        reader.skip(1);

        let caps_lower = reader
            .read_u16_le()
            .ok_or_else(|| Error::protocol("missing capability flags"))?;
        let collation = reader.read_u8().unwrap_or(0);
        let status_flags = reader.read_u16_le().unwrap_or(0);
        let caps_upper = reader.read_u16_le().unwrap_or(0);
        let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

        let auth_data_len = usize::from(reader.read_u8().unwrap_or(0));
        reader.skip(10);

        let mut seed = part1.to_vec();
        if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len2 = auth_data_len.saturating_sub(8).max(13);
            let part2 = reader
                .read_bytes(len2.min(reader.remaining()))
                .unwrap_or_default();
            seed.extend_from_slice(part2.strip_suffix(&[0]).unwrap_or(part2));
        }

        let auth_plugin_name = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader.read_null_string()
        } else {
            plugins::MYSQL_NATIVE_PASSWORD.to_string()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            seed,
            capabilities,
            collation,
            status_flags,
            auth_plugin_name,
        })
    }
}

/// Fields of the client's handshake response.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub collation: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse<'_> {
    /// Encode the protocol-41 response payload.
    pub fn encode(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut writer = PacketWriter::with_capacity(128);
        writer.write_u32_le(caps);
        writer.write_u32_le(self.max_packet_size);
        writer.write_u8(self.collation);
        writer.write_zeros(23);
        writer.write_null_string(self.user);

        write_auth_response(&mut writer, caps, self.auth_response);

        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.unwrap_or(""));
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.auth_plugin);
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            write_attributes(&mut writer, self.attributes);
        }
        writer.into_bytes()
    }
}

fn write_auth_response(writer: &mut PacketWriter, caps: u32, response: &[u8]) {
    if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        writer.write_lenenc_bytes(response);
    } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let response = &response[..response.len().min(usize::from(u8::MAX))];
        writer.write_u8(response.len() as u8);
        writer.write_bytes(response);
    } else {
        writer.write_bytes(response);
        writer.write_u8(0);
    }
}

fn write_attributes(writer: &mut PacketWriter, attributes: &[(String, String)]) {
    let mut attrs = PacketWriter::new();
    for (key, value) in attributes {
        attrs.write_lenenc_string(key);
        attrs.write_lenenc_string(value);
    }
    writer.write_lenenc_bytes(attrs.as_bytes());
}

/// Connection attributes sent with `CLIENT_CONNECT_ATTRS`: the driver's
/// own, then the configured ones.
pub fn connect_attributes(config: &MySqlConfig) -> Vec<(String, String)> {
    let mut attrs = vec![
        ("_client_name".to_string(), env!("CARGO_PKG_NAME").to_string()),
        (
            "_client_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
        ("_os".to_string(), std::env::consts::OS.to_string()),
        ("_platform".to_string(), std::env::consts::ARCH.to_string()),
        ("_pid".to_string(), std::process::id().to_string()),
    ];
    attrs.extend(
        config
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    attrs
}

/// COM_CHANGE_USER payload, used to reset a session on servers without
/// COM_RESET_CONNECTION.
#[allow(clippy::too_many_arguments)]
pub fn build_change_user_packet(
    caps: u32,
    user: &str,
    auth_response: &[u8],
    database: Option<&str>,
    collation: u16,
    auth_plugin: &str,
    attributes: &[(String, String)],
) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::ChangeUser);
    writer.write_null_string(user);
    if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let response = &auth_response[..auth_response.len().min(usize::from(u8::MAX))];
        writer.write_u8(response.len() as u8);
        writer.write_bytes(response);
    } else {
        writer.write_bytes(auth_response);
        writer.write_u8(0);
    }
    writer.write_null_string(database.unwrap_or(""));
    writer.write_u16_le(collation);
    if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        writer.write_null_string(auth_plugin);
    }
    if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
        write_attributes(&mut writer, attributes);
    }
    writer.into_bytes()
}

/// Parse an auth switch request (`0xFE`, plugin name, new seed).
#[allow(clippy::result_large_err)]
pub fn parse_auth_switch(payload: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut reader = PacketReader::new(payload);
    if reader.read_u8() != Some(0xFE) {
        return Err(Error::protocol("not an auth switch request"));
    }
    if reader.is_empty() {
        return Err(Error::connection(
            ConnectionErrorKind::Authentication,
            "server requested the pre-4.1 password protocol, which is not supported",
        ));
    }
    let plugin = reader.read_null_string();
    let data = reader.read_rest();
    Ok((plugin, data.strip_suffix(&[0]).unwrap_or(data).to_vec()))
}

/// What the connection phase settled on.
#[derive(Debug, Clone)]
pub struct Established {
    pub handshake: InitialHandshake,
    /// Client capabilities intersected with the server's
    pub capabilities: u32,
    pub status_flags: u16,
    pub auth_plugin: AuthPlugin,
}

/// Run the connection phase over a fresh transport.
#[allow(clippy::result_large_err)]
#[tracing::instrument(level = "debug", skip_all, fields(host = %config.host, user = %config.user))]
pub fn establish(
    stream: PacketStream<Transport>,
    config: &MySqlConfig,
) -> Result<(PacketStream<Transport>, Established)> {
    let mut stream = stream;
    let mut state = AuthState::AwaitingHandshake;

    let handshake = InitialHandshake::parse(stream.read_packet()?)?;
    tracing::debug!(
        server_version = %handshake.server_version,
        connection_id = handshake.connection_id,
        plugin = %handshake.auth_plugin_name,
        "received server handshake"
    );

    if handshake.capabilities & capabilities::CLIENT_PROTOCOL_41 == 0 {
        return Err(Error::connection(
            ConnectionErrorKind::Connect,
            "server does not support protocol 4.1",
        ));
    }

    advance(&mut state, AuthState::NegotiatingCapabilities);
    let mut caps = config.capability_flags() & handshake.capabilities;
    let collation = u8::try_from(config.collation).unwrap_or(u8::MAX);

    let use_tls = tls::validate_ssl_mode(config.ssl_mode, handshake.capabilities)?
        && (cfg!(feature = "tls") || config.ssl_mode.is_required());
    if use_tls {
        caps |= capabilities::CLIENT_SSL;
        advance(&mut state, AuthState::SslUpgrade);
        stream.write_packet(&tls::build_ssl_request_packet(
            caps,
            config.max_packet_size,
            collation,
        ))?;
        stream = stream.map_inner(|transport| upgrade_tls(transport, config))?;
    }

    let plugin = if config.integrated_security {
        AuthPlugin::Integrated
    } else {
        AuthPlugin::from_name(&handshake.auth_plugin_name).unwrap_or(AuthPlugin::NativePassword)
    };
    let ctx = auth_context(config, stream.get_ref().is_secure());
    let auth_response = plugin.scramble(&handshake.seed, &ctx)?;
    let attributes = connect_attributes(config);

    let response = HandshakeResponse {
        capabilities: caps,
        max_packet_size: config.max_packet_size,
        collation,
        user: &config.user,
        auth_response: &auth_response,
        database: config.database.as_deref(),
        auth_plugin: plugin.name(),
        attributes: &attributes,
    };
    stream.write_packet(&response.encode())?;
    advance(&mut state, AuthState::AwaitingAuthResult);

    let (ok, auth_plugin) =
        read_auth_result(&mut stream, plugin, handshake.seed.clone(), &ctx, &mut state)?;

    Ok((
        stream,
        Established {
            handshake,
            capabilities: caps,
            status_flags: ok.status_flags,
            auth_plugin,
        },
    ))
}

/// Auth inputs drawn from the configuration.
pub fn auth_context(config: &MySqlConfig, secure: bool) -> AuthContext<'_> {
    AuthContext {
        password: config.password.as_deref().unwrap_or(""),
        secure,
        allow_cleartext: config.allow_cleartext_password,
        integrated: config.integrated_provider.as_deref(),
    }
}

/// Drive the exchange after a handshake response or COM_CHANGE_USER until
/// the server's OK. Returns the plugin that finally authenticated.
#[allow(clippy::result_large_err)]
pub fn read_auth_result<S: Read + Write>(
    stream: &mut PacketStream<S>,
    plugin: AuthPlugin,
    seed: Vec<u8>,
    ctx: &AuthContext<'_>,
    state: &mut AuthState,
) -> Result<(OkPacket, AuthPlugin)> {
    let mut plugin = plugin;
    let mut seed = seed;

    loop {
        let payload = stream.read_packet()?.to_vec();
        match payload.first() {
            Some(0x00) => {
                let ok = PacketReader::new(&payload)
                    .parse_ok_packet()
                    .ok_or_else(|| Error::protocol("malformed OK packet after authentication"))?;
                advance(state, AuthState::Authenticated);
                return Ok((ok, plugin));
            }
            Some(0xFF) => {
                let err = PacketReader::new(&payload)
                    .parse_err_packet()
                    .ok_or_else(|| Error::protocol("malformed error packet during authentication"))?;
                return Err(login_error(err.error_code, &err.error_message));
            }
            Some(0xFE) => {
                let (name, data) = parse_auth_switch(&payload)?;
                plugin = AuthPlugin::from_name(&name).ok_or_else(|| {
                    Error::connection(
                        ConnectionErrorKind::Authentication,
                        format!("server requested unsupported authentication plugin '{name}'"),
                    )
                })?;
                advance(state, AuthState::AuthSwitch);
                tracing::debug!(plugin = %name, "authentication switch");
                seed = data;
                let response = plugin.scramble(&seed, ctx)?;
                stream.write_packet(&response)?;
            }
            Some(0x01) => {
                advance(state, AuthState::MoreData);
                match plugin.continue_auth(&payload[1..], &seed, ctx)? {
                    AuthStep::Send(bytes) => stream.write_packet(&bytes)?,
                    AuthStep::Wait => {}
                }
            }
            _ => {
                return Err(Error::protocol(format!(
                    "unexpected packet during authentication: {:02X?}",
                    payload.first()
                )));
            }
        }
    }
}

fn login_error(code: u16, message: &str) -> Error {
    let kind = match code {
        error_codes::ER_MUST_CHANGE_PASSWORD_LOGIN => ConnectionErrorKind::PasswordExpired,
        error_codes::ER_ACCESS_DENIED_ERROR | error_codes::ER_DBACCESS_DENIED_ERROR => {
            ConnectionErrorKind::Authentication
        }
        _ => ConnectionErrorKind::Connect,
    };
    Error::connection(kind, format!("{message} ({code})"))
}

fn advance(state: &mut AuthState, next: AuthState) {
    tracing::trace!(from = ?*state, to = ?next, "auth state");
    *state = next;
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn upgrade_tls(transport: Transport, config: &MySqlConfig) -> Result<Transport> {
    match transport {
        Transport::Plain(socket) => {
            let stream = TlsStream::connect(socket, &config.tls, &config.host, config.ssl_mode)?;
            tracing::debug!(version = ?stream.protocol_version(), "TLS established");
            Ok(Transport::Tls(Box::new(stream)))
        }
        tls @ Transport::Tls(_) => Ok(tls),
    }
}

#[cfg(not(feature = "tls"))]
#[allow(clippy::result_large_err)]
fn upgrade_tls(transport: Transport, config: &MySqlConfig) -> Result<Transport> {
    let Transport::Plain(socket) = transport;
    TlsStream::connect(socket, &config.tls, &config.host, config.ssl_mode)
        .map(|stream| Transport::Plain(stream.into_inner()))
}

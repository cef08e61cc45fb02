//! MySQL connection configuration.
//!
//! Provides connection parameters for establishing MySQL connections
//! including authentication, SSL, timeouts, pooling and the options that
//! shape how result columns are decoded.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use sqlwire_core::{Error, Result};
use sqlwire_pool::PoolConfig;

use crate::auth::IntegratedAuthProvider;
use crate::charset::{self, collation};
use crate::types::ColumnPolicy;

/// SSL mode for MySQL connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disable,
    /// Prefer SSL if available, fall back to non-SSL
    Preferred,
    /// Require SSL connection
    Required,
    /// Require SSL and verify server certificate
    VerifyCa,
    /// Require SSL and verify server certificate matches hostname
    VerifyIdentity,
}

impl SslMode {
    /// Check if SSL should be attempted.
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Check if SSL is required.
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }

    const fn as_str(self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Preferred => "preferred",
            SslMode::Required => "required",
            SslMode::VerifyCa => "verify_ca",
            SslMode::VerifyIdentity => "verify_identity",
        }
    }
}

/// Certificates and verification options for TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM file with the CA certificate(s) to trust
    pub ca_cert_path: Option<PathBuf>,
    /// PEM client certificate for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// PEM private key matching `client_cert_path`
    pub client_key_path: Option<PathBuf>,
    /// Accept any server certificate
    pub danger_skip_verify: bool,
    /// Name sent for SNI and checked against the certificate, if not the host
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    /// Skip certificate verification. Only for testing.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// MySQL connection configuration.
#[derive(Debug, Clone)]
pub struct MySqlConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 3306)
    pub port: u16,
    /// Unix socket path; takes precedence over host and port
    pub socket_path: Option<PathBuf>,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Database name to connect to (optional at connect time)
    pub database: Option<String>,
    /// Character set name (default: utf8mb4)
    pub charset: String,
    /// Collation id sent in the handshake, derived from `charset`
    pub collation: u16,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Time budget for one command; `None` waits forever
    pub command_timeout: Option<Duration>,
    /// Budget for the side connection that cancels a timed-out command,
    /// and for draining the cancelled result
    pub cancel_timeout: Duration,
    /// SSL mode
    pub ssl_mode: SslMode,
    pub tls: TlsConfig,
    /// Enable compression (CLIENT_COMPRESS capability)
    pub compression: bool,
    /// Route connections through the process-wide pool manager
    pub pooling: bool,
    pub pool: PoolConfig,
    /// `TINYINT(1)` columns decode as booleans
    pub treat_tiny_as_boolean: bool,
    /// `BINARY(16)` columns hold GUIDs instead of `CHAR(36)`
    pub old_guids: bool,
    /// Honor the BINARY flag on BLOB columns with a text charset
    pub respect_binary_flags: bool,
    /// Statements may use `@variables`; SQL text is sent verbatim either way
    pub allow_user_variables: bool,
    /// Report affected rows instead of found rows for UPDATE
    pub use_affected_rows: bool,
    /// Allow several statements in one request (CLIENT_MULTI_STATEMENTS)
    pub allow_batch: bool,
    /// Decode binary blobs as UTF-8 text
    pub treat_blobs_as_utf8: bool,
    /// Only blobs whose column name matches are decoded as text
    pub blob_as_utf8_include: Option<String>,
    /// Blobs whose column name matches stay binary
    pub blob_as_utf8_exclude: Option<String>,
    /// Zero dates come back as text instead of NULL
    pub allow_zero_datetime: bool,
    /// Accept a sandboxed session for an account with an expired password
    pub allow_expired_password: bool,
    /// Send `mysql_clear_password` responses over an insecure channel
    pub allow_cleartext_password: bool,
    /// Local infile handling (disabled by default for security)
    pub local_infile: bool,
    /// Only files under this directory may be sent for LOCAL INFILE
    pub local_infile_dir: Option<PathBuf>,
    /// Authenticate with the OS identity (Windows only)
    pub integrated_security: bool,
    /// Token source for integrated security
    pub integrated_provider: Option<Arc<dyn IntegratedAuthProvider>>,
    /// Max allowed packet size (default: 64MB)
    pub max_packet_size: u32,
    /// Additional connection attributes
    pub attributes: BTreeMap<String, String>,
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            socket_path: None,
            user: String::new(),
            password: None,
            database: None,
            charset: "utf8mb4".to_string(),
            collation: collation::DEFAULT,
            connect_timeout: Duration::from_secs(15),
            command_timeout: Some(Duration::from_secs(30)),
            cancel_timeout: Duration::from_secs(2),
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            compression: false,
            pooling: true,
            pool: PoolConfig::default(),
            treat_tiny_as_boolean: true,
            old_guids: false,
            respect_binary_flags: true,
            allow_user_variables: false,
            use_affected_rows: false,
            allow_batch: true,
            treat_blobs_as_utf8: false,
            blob_as_utf8_include: None,
            blob_as_utf8_exclude: None,
            allow_zero_datetime: false,
            allow_expired_password: false,
            allow_cleartext_password: false,
            local_infile: false,
            local_infile_dir: None,
            integrated_security: false,
            integrated_provider: None,
            max_packet_size: 64 * 1024 * 1024, // 64MB
            attributes: BTreeMap::new(),
        }
    }
}

impl MySqlConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Connect through a unix socket instead of TCP.
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    /// Set the username.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the character set by name. The collation follows the charset's
    /// default; unknown names are reported by [`validate`](Self::validate).
    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        if let Some(id) = charset::default_collation(&self.charset) {
            self.collation = id;
        }
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-command timeout. `Duration::ZERO` disables it.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Set the budget used to cancel and drain a timed-out command.
    pub fn cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    /// Set the SSL mode.
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    /// Set the TLS certificates and verification options.
    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Enable or disable compression.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Enable or disable pooling.
    pub fn pooling(mut self, enabled: bool) -> Self {
        self.pooling = enabled;
        self
    }

    /// Set the pool limits.
    pub fn pool_config(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn treat_tiny_as_boolean(mut self, enabled: bool) -> Self {
        self.treat_tiny_as_boolean = enabled;
        self
    }

    pub fn old_guids(mut self, enabled: bool) -> Self {
        self.old_guids = enabled;
        self
    }

    pub fn respect_binary_flags(mut self, enabled: bool) -> Self {
        self.respect_binary_flags = enabled;
        self
    }

    pub fn allow_user_variables(mut self, enabled: bool) -> Self {
        self.allow_user_variables = enabled;
        self
    }

    pub fn use_affected_rows(mut self, enabled: bool) -> Self {
        self.use_affected_rows = enabled;
        self
    }

    pub fn allow_batch(mut self, enabled: bool) -> Self {
        self.allow_batch = enabled;
        self
    }

    /// Decode binary blobs as UTF-8, optionally filtered by column name.
    pub fn treat_blobs_as_utf8(
        mut self,
        enabled: bool,
        include: Option<&str>,
        exclude: Option<&str>,
    ) -> Self {
        self.treat_blobs_as_utf8 = enabled;
        self.blob_as_utf8_include = include.map(str::to_string);
        self.blob_as_utf8_exclude = exclude.map(str::to_string);
        self
    }

    pub fn allow_zero_datetime(mut self, enabled: bool) -> Self {
        self.allow_zero_datetime = enabled;
        self
    }

    pub fn allow_expired_password(mut self, enabled: bool) -> Self {
        self.allow_expired_password = enabled;
        self
    }

    pub fn allow_cleartext_password(mut self, enabled: bool) -> Self {
        self.allow_cleartext_password = enabled;
        self
    }

    /// Enable or disable local infile handling.
    ///
    /// # Security Warning
    /// Enabling local infile can be a security risk. Only enable if you
    /// trust the server and understand the implications.
    pub fn local_infile(mut self, enabled: bool) -> Self {
        self.local_infile = enabled;
        self
    }

    /// Restrict LOCAL INFILE to files under `dir`. Implies `local_infile`.
    pub fn local_infile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_infile = true;
        self.local_infile_dir = Some(dir.into());
        self
    }

    /// Use Windows integrated authentication through `provider`.
    pub fn integrated_security(mut self, provider: Arc<dyn IntegratedAuthProvider>) -> Self {
        self.integrated_security = true;
        self.integrated_provider = Some(provider);
        self
    }

    /// Set the max allowed packet size.
    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set a connection attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get the socket address string for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject unusable option combinations before any I/O.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.integrated_security {
            if !cfg!(windows) {
                return Err(Error::config(
                    "integrated security is only supported on Windows",
                ));
            }
            if self.integrated_provider.is_none() {
                return Err(Error::config(
                    "integrated security requires an authentication provider",
                ));
            }
        }
        if charset::lookup(&self.charset).is_none() {
            return Err(Error::config(format!(
                "unknown character set '{}'",
                self.charset
            )));
        }
        if self.max_packet_size == 0 {
            return Err(Error::config("max packet size must be greater than zero"));
        }
        if self.socket_path.is_some() && cfg!(not(unix)) {
            return Err(Error::config(
                "unix socket connections are not supported on this platform",
            ));
        }
        self.column_policy()?;
        crate::tls::validate_tls_config(self.ssl_mode, &self.tls)?;
        if self.pooling {
            self.pool.validate()?;
        }
        Ok(())
    }

    /// Column decoding options, with the blob name patterns compiled.
    #[allow(clippy::result_large_err)]
    pub fn column_policy(&self) -> Result<ColumnPolicy> {
        let compile = |pattern: &Option<String>, which: &str| {
            pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| Error::config(format!("invalid blob {which} pattern: {e}")))
        };
        Ok(ColumnPolicy {
            treat_tiny_as_boolean: self.treat_tiny_as_boolean,
            old_guids: self.old_guids,
            respect_binary_flags: self.respect_binary_flags,
            treat_blobs_as_utf8: self.treat_blobs_as_utf8,
            blob_include: compile(&self.blob_as_utf8_include, "include")?,
            blob_exclude: compile(&self.blob_as_utf8_exclude, "exclude")?,
            allow_zero_datetime: self.allow_zero_datetime,
        })
    }

    /// Normalized key identifying the pool this configuration uses.
    ///
    /// Two configurations share a pool exactly when their keys are equal.
    /// Integrated security without session reset adds the OS user, so
    /// sessions authenticated as one user never serve another.
    pub fn pool_key(&self) -> String {
        let mut key = String::with_capacity(256);
        let mut push = |name: &str, value: &dyn std::fmt::Display| {
            let _ = write!(key, "{name}={value};");
        };
        match &self.socket_path {
            Some(path) => push("socket", &path.display()),
            None => {
                push("host", &self.host.to_ascii_lowercase());
                push("port", &self.port);
            }
        }
        push("user", &self.user);
        push("password", &self.password.as_deref().unwrap_or(""));
        push("database", &self.database.as_deref().unwrap_or(""));
        push("charset", &self.charset.to_ascii_lowercase());
        push("ssl_mode", &self.ssl_mode.as_str());
        if let Some(ca) = &self.tls.ca_cert_path {
            push("ssl_ca", &ca.display());
        }
        if let Some(cert) = &self.tls.client_cert_path {
            push("ssl_cert", &cert.display());
        }
        push("compress", &self.compression);
        push("connect_timeout", &self.connect_timeout.as_millis());
        push(
            "command_timeout",
            &self.command_timeout.map_or(0, |t| t.as_millis()),
        );
        push("min_pool", &self.pool.min_connections);
        push("max_pool", &self.pool.max_connections);
        push("reset", &self.pool.reset_on_release);
        push("tiny_as_bool", &self.treat_tiny_as_boolean);
        push("old_guids", &self.old_guids);
        push("respect_binary", &self.respect_binary_flags);
        push("user_variables", &self.allow_user_variables);
        push("affected_rows", &self.use_affected_rows);
        push("batch", &self.allow_batch);
        push("blobs_as_utf8", &self.treat_blobs_as_utf8);
        push(
            "blob_include",
            &self.blob_as_utf8_include.as_deref().unwrap_or(""),
        );
        push(
            "blob_exclude",
            &self.blob_as_utf8_exclude.as_deref().unwrap_or(""),
        );
        push("zero_datetime", &self.allow_zero_datetime);
        push("expired_password", &self.allow_expired_password);
        push("cleartext", &self.allow_cleartext_password);
        push("local_infile", &self.local_infile);
        if let Some(dir) = &self.local_infile_dir {
            push("local_infile_dir", &dir.display());
        }
        push("max_packet", &self.max_packet_size);
        push("integrated", &self.integrated_security);
        for (name, value) in &self.attributes {
            push(&format!("attr.{name}"), value);
        }
        if self.integrated_security && !self.pool.reset_on_release {
            push("os_user", &os_user());
        }
        key
    }

    /// Capability flags this configuration asks for, before they are
    /// intersected with the server's offer.
    pub fn capability_flags(&self) -> u32 {
        use crate::protocol::capabilities::{
            CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS, CLIENT_COMPRESS, CLIENT_CONNECT_ATTRS,
            CLIENT_CONNECT_WITH_DB, CLIENT_FOUND_ROWS, CLIENT_LOCAL_FILES,
            CLIENT_MULTI_STATEMENTS, DEFAULT_CLIENT_FLAGS,
        };

        let mut flags = DEFAULT_CLIENT_FLAGS | CLIENT_CONNECT_ATTRS;

        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }

        if self.compression {
            flags |= CLIENT_COMPRESS;
        }

        if self.local_infile {
            flags |= CLIENT_LOCAL_FILES;
        }

        if self.allow_batch {
            flags |= CLIENT_MULTI_STATEMENTS;
        }

        if !self.use_affected_rows {
            flags |= CLIENT_FOUND_ROWS;
        }

        if self.allow_expired_password {
            flags |= CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS;
        }

        flags
    }
}

fn os_user() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = MySqlConfig::new()
            .host("db.example.com")
            .port(3307)
            .user("myuser")
            .password("secret")
            .database("testdb")
            .connect_timeout(Duration::from_secs(10))
            .ssl_mode(SslMode::Required)
            .compression(true)
            .attribute("program_name", "myapp");

        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.port, 3307);
        assert_eq!(config.user, "myuser");
        assert_eq!(config.password, Some("secret".to_string()));
        assert_eq!(config.database, Some("testdb".to_string()));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.ssl_mode, SslMode::Required);
        assert!(config.compression);
        assert_eq!(
            config.attributes.get("program_name"),
            Some(&"myapp".to_string())
        );
    }

    #[test]
    fn test_socket_addr() {
        let config = MySqlConfig::new().host("db.example.com").port(3307);
        assert_eq!(config.socket_addr(), "db.example.com:3307");
    }

    #[test]
    fn test_ssl_mode_properties() {
        assert!(!SslMode::Disable.should_try_ssl());
        assert!(!SslMode::Disable.is_required());

        assert!(SslMode::Preferred.should_try_ssl());
        assert!(!SslMode::Preferred.is_required());

        assert!(SslMode::Required.should_try_ssl());
        assert!(SslMode::Required.is_required());

        assert!(SslMode::VerifyCa.is_required());
        assert!(SslMode::VerifyIdentity.is_required());
    }

    #[test]
    fn test_capability_flags() {
        use crate::protocol::capabilities::*;

        let config = MySqlConfig::new().database("test").compression(true);
        let flags = config.capability_flags();

        assert!(flags & CLIENT_CONNECT_WITH_DB != 0);
        assert!(flags & CLIENT_COMPRESS != 0);
        assert!(flags & CLIENT_PROTOCOL_41 != 0);
        assert!(flags & CLIENT_SECURE_CONNECTION != 0);
        assert!(flags & CLIENT_FOUND_ROWS != 0);
        assert!(flags & CLIENT_MULTI_STATEMENTS != 0);
        assert!(flags & CLIENT_LOCAL_FILES == 0);
        assert!(flags & CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS == 0);

        let flags = MySqlConfig::new()
            .use_affected_rows(true)
            .allow_batch(false)
            .allow_expired_password(true)
            .local_infile(true)
            .capability_flags();
        assert!(flags & CLIENT_FOUND_ROWS == 0);
        assert!(flags & CLIENT_MULTI_STATEMENTS == 0);
        assert!(flags & CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS != 0);
        assert!(flags & CLIENT_LOCAL_FILES != 0);
    }

    #[test]
    fn test_default_config() {
        let config = MySqlConfig::default();

        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.ssl_mode, SslMode::Disable);
        assert_eq!(config.collation, collation::UTF8MB4_GENERAL_CI);
        assert!(config.pooling);
        assert!(config.treat_tiny_as_boolean);
        assert!(!config.compression);
        assert!(!config.local_infile);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_charset_sets_collation() {
        let config = MySqlConfig::new().charset("latin1");
        assert_eq!(config.collation, collation::LATIN1_SWEDISH_CI);
        assert!(MySqlConfig::new().charset("klingon").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_blob_pattern() {
        let config = MySqlConfig::new().treat_blobs_as_utf8(true, Some("(unclosed"), None);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let policy = MySqlConfig::new()
            .treat_blobs_as_utf8(true, Some("^doc_"), Some("_raw$"))
            .column_policy()
            .unwrap();
        assert!(policy.blob_as_utf8("doc_body"));
        assert!(!policy.blob_as_utf8("doc_raw"));
        assert!(!policy.blob_as_utf8("payload"));
    }

    #[derive(Debug)]
    struct NoTokens;

    impl IntegratedAuthProvider for NoTokens {
        fn initial_token(&self, _seed: &[u8]) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn next_token(&self, _challenge: &[u8]) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[test]
    #[cfg(not(windows))]
    fn test_integrated_security_rejected_off_windows() {
        let config = MySqlConfig::new().integrated_security(Arc::new(NoTokens));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_pool_key_normalization() {
        let a = MySqlConfig::new().host("DB.example.com").user("app");
        let b = MySqlConfig::new().host("db.example.com").user("app");
        assert_eq!(a.pool_key(), b.pool_key());

        let c = b.clone().password("other");
        assert_ne!(b.pool_key(), c.pool_key());

        let with_attrs = |first: (&str, &str), second: (&str, &str)| {
            MySqlConfig::new()
                .attribute(first.0, first.1)
                .attribute(second.0, second.1)
                .pool_key()
        };
        assert_eq!(
            with_attrs(("a", "1"), ("b", "2")),
            with_attrs(("b", "2"), ("a", "1"))
        );
    }

    #[test]
    fn test_pool_key_adds_os_user_for_integrated_security() {
        let plain = MySqlConfig::new();
        assert!(!plain.pool_key().contains("os_user="));

        let integrated = MySqlConfig::new().integrated_security(Arc::new(NoTokens));
        assert!(integrated.pool_key().contains("os_user="));

        let mut with_reset = integrated.clone();
        with_reset.pool.reset_on_release = true;
        assert!(!with_reset.pool_key().contains("os_user="));
    }
}

//! TLS support for MySQL connections.
//!
//! The upgrade happens in the middle of the handshake:
//!
//! 1. Server sends the initial handshake with `CLIENT_SSL` capability
//! 2. Client sends the short SSL request packet:
//!    - 4 bytes: capability flags (with `CLIENT_SSL`)
//!    - 4 bytes: max packet size
//!    - 1 byte: character set
//!    - 23 bytes: reserved (zeros)
//! 3. Client runs the rustls handshake on the raw socket
//! 4. The handshake response and everything after it travel encrypted
//!
//! The stream itself needs the `tls` feature; without it, any mode other
//! than [`SslMode::Disable`] or a `Preferred` fallback fails to connect.

#![allow(clippy::cast_possible_truncation)]

use crate::config::{SslMode, TlsConfig};
use crate::protocol::{PacketWriter, capabilities};
use sqlwire_core::Error;
use sqlwire_core::error::{ConnectionError, ConnectionErrorKind};

#[cfg(feature = "tls")]
use std::io::{Read, Write};
#[cfg(feature = "tls")]
use std::sync::Arc;

/// Build the SSL request payload.
///
/// Sent after the server handshake, before the TLS handshake. It carries
/// the first 32 bytes of a handshake response so the server knows the
/// client capabilities before encryption starts.
pub fn build_ssl_request_packet(client_caps: u32, max_packet_size: u32, collation: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le(client_caps | capabilities::CLIENT_SSL);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(collation);
    writer.write_zeros(23);
    writer.into_bytes()
}

/// Does the server offer `CLIENT_SSL`?
pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Validate SSL mode against server capabilities.
///
/// # Returns
///
/// - `Ok(true)` if SSL should be used
/// - `Ok(false)` if SSL should not be used
/// - `Err(_)` if SSL is required but not supported by server
#[allow(clippy::result_large_err)]
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: u32) -> Result<bool, Error> {
    let server_supports = server_supports_ssl(server_caps);

    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(server_supports),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if server_supports {
                Ok(true)
            } else {
                Err(tls_error("SSL required but server does not support it"))
            }
        }
    }
}

/// Validate TLS configuration for the given SSL mode.
///
/// Verifying modes without a CA file trust the bundled web PKI roots.
#[allow(clippy::result_large_err)]
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<(), Error> {
    if ssl_mode == SslMode::Disable {
        return Ok(());
    }
    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(tls_error(
            "client certificate and client key must be set together for mutual TLS",
        ));
    }
    Ok(())
}

/// Create a TLS-related connection error.
fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

/// A rustls session over a blocking stream.
#[cfg(feature = "tls")]
pub struct TlsStream<S> {
    conn: rustls::ClientConnection,
    stream: S,
}

#[cfg(feature = "tls")]
impl<S> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .field("is_handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> TlsStream<S> {
    /// Run the TLS handshake over `stream`.
    ///
    /// `host` is used for SNI and, in `VerifyIdentity` mode, checked against
    /// the certificate unless `tls_config.server_name` overrides it.
    #[allow(clippy::result_large_err)]
    pub fn connect(
        mut stream: S,
        tls_config: &TlsConfig,
        host: &str,
        ssl_mode: SslMode,
    ) -> Result<Self, Error> {
        let config = build_client_config(tls_config, ssl_mode)?;
        let sni = tls_config.server_name.as_deref().unwrap_or(host);
        let server_name = rustls::pki_types::ServerName::try_from(sni.to_string())
            .map_err(|e| tls_error(format!("invalid server name '{sni}': {e}")))?;

        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| tls_error(format!("failed to start TLS session: {e}")))?;

        while conn.is_handshaking() {
            conn.complete_io(&mut stream)
                .map_err(|e| tls_error(format!("TLS handshake failed: {e}")))?;
        }
        tracing::debug!(
            version = ?conn.protocol_version(),
            cipher = ?conn.negotiated_cipher_suite().map(|s| s.suite()),
            "TLS established"
        );
        Ok(Self { conn, stream })
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).read(buf)
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).flush()
    }
}

/// Pick certificate verification for the SSL mode.
///
/// `Preferred` and `Required` encrypt without verifying unless a CA file is
/// given. `VerifyCa` checks the chain only; `VerifyIdentity` also checks the
/// host name.
#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn build_client_config(
    tls_config: &TlsConfig,
    ssl_mode: SslMode,
) -> Result<rustls::ClientConfig, Error> {
    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::ServerCertVerifier;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?;

    let verify = match ssl_mode {
        SslMode::Disable => return Err(tls_error("TLS requested with SslMode::Disable")),
        _ if tls_config.danger_skip_verify => false,
        SslMode::Preferred | SslMode::Required => tls_config.ca_cert_path.is_some(),
        SslMode::VerifyCa | SslMode::VerifyIdentity => true,
    };

    let verifier: Arc<dyn ServerCertVerifier> = if verify {
        let roots = Arc::new(root_store(tls_config)?);
        let webpki = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| tls_error(format!("failed to build certificate verifier: {e}")))?;
        if ssl_mode == SslMode::VerifyIdentity {
            webpki
        } else {
            Arc::new(verify::ChainOnly(webpki))
        }
    } else {
        Arc::new(verify::AcceptAny(provider))
    };

    let builder = builder
        .dangerous()
        .with_custom_certificate_verifier(verifier);
    add_client_auth(builder, tls_config)
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn root_store(tls_config: &TlsConfig) -> Result<rustls::RootCertStore, Error> {
    let mut roots = rustls::RootCertStore::empty();
    let Some(ca_path) = &tls_config.ca_cert_path else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    };
    let certs = load_certs(ca_path)?;
    let (added, _ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(tls_error(format!(
            "no usable CA certificates in '{}'",
            ca_path.display()
        )));
    }
    Ok(roots)
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn load_certs(
    path: &std::path::Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(format!("failed to open '{}': {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse '{}': {e}", path.display())))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    let (Some(cert_path), Some(key_path)) =
        (&tls_config.client_cert_path, &tls_config.client_key_path)
    else {
        return Ok(builder.with_no_client_auth());
    };

    let certs = load_certs(cert_path)?;
    let key_file = std::fs::File::open(key_path)
        .map_err(|e| tls_error(format!("failed to open '{}': {e}", key_path.display())))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| tls_error(format!("failed to parse client key: {e}")))?
        .ok_or_else(|| tls_error(format!("no private key in '{}'", key_path.display())))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error(format!("failed to configure client certificate: {e}")))
}

#[cfg(feature = "tls")]
mod verify {
    use std::sync::Arc;

    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    /// Checks signatures but accepts any certificate.
    #[derive(Debug)]
    pub(super) struct AcceptAny(pub(super) Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    /// Verifies the chain but not the host name.
    #[derive(Debug)]
    pub(super) struct ChainOnly(pub(super) Arc<WebPkiServerVerifier>);

    impl ServerCertVerifier for ChainOnly {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            match self.0.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                // Name mismatch errors differ across rustls releases.
                Err(RustlsError::InvalidCertificate(e))
                    if format!("{e:?}").starts_with("NotValidForName") =>
                {
                    Ok(ServerCertVerified::assertion())
                }
                other => other,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            self.0.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            self.0.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.supported_verify_schemes()
        }
    }
}

/// Placeholder when the `tls` feature is disabled.
#[cfg(not(feature = "tls"))]
#[derive(Debug)]
pub struct TlsStream<S> {
    inner: S,
}

#[cfg(not(feature = "tls"))]
impl<S> TlsStream<S> {
    /// Always fails: TLS needs the `tls` feature.
    #[allow(clippy::result_large_err)]
    pub fn connect(
        stream: S,
        _tls_config: &TlsConfig,
        _host: &str,
        _ssl_mode: SslMode,
    ) -> Result<Self, Error> {
        drop(stream);
        Err(tls_error(
            "TLS support requires the 'tls' feature of sqlwire-mysql",
        ))
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charset::collation;

    #[test]
    fn test_build_ssl_request_packet() {
        let payload = build_ssl_request_packet(
            capabilities::DEFAULT_CLIENT_FLAGS,
            16 * 1024 * 1024,
            collation::UTF8MB4_GENERAL_CI as u8,
        );
        assert_eq!(payload.len(), 32);

        let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert!(caps & capabilities::CLIENT_SSL != 0);
        assert_eq!(&payload[4..8], &(16u32 * 1024 * 1024).to_le_bytes());
        assert_eq!(payload[8], 45);
        assert!(payload[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_server_supports_ssl() {
        assert!(server_supports_ssl(capabilities::CLIENT_SSL));
        assert!(server_supports_ssl(
            capabilities::CLIENT_SSL | capabilities::CLIENT_PROTOCOL_41
        ));
        assert!(!server_supports_ssl(0));
        assert!(!server_supports_ssl(capabilities::CLIENT_PROTOCOL_41));
    }

    #[test]
    fn test_validate_ssl_mode_disable() {
        assert!(!validate_ssl_mode(SslMode::Disable, 0).unwrap());
        assert!(!validate_ssl_mode(SslMode::Disable, capabilities::CLIENT_SSL).unwrap());
    }

    #[test]
    fn test_validate_ssl_mode_preferred() {
        // Preferred without SSL support -> no SSL
        assert!(!validate_ssl_mode(SslMode::Preferred, 0).unwrap());
        // Preferred with SSL support -> use SSL
        assert!(validate_ssl_mode(SslMode::Preferred, capabilities::CLIENT_SSL).unwrap());
    }

    #[test]
    fn test_validate_ssl_mode_required() {
        // Required without SSL support -> error
        assert!(validate_ssl_mode(SslMode::Required, 0).is_err());
        // Required with SSL support -> use SSL
        assert!(validate_ssl_mode(SslMode::Required, capabilities::CLIENT_SSL).unwrap());
    }

    #[test]
    fn test_validate_ssl_mode_verify() {
        // VerifyCa/VerifyIdentity without SSL support -> error
        assert!(validate_ssl_mode(SslMode::VerifyCa, 0).is_err());
        assert!(validate_ssl_mode(SslMode::VerifyIdentity, 0).is_err());

        // With SSL support -> use SSL
        assert!(validate_ssl_mode(SslMode::VerifyCa, capabilities::CLIENT_SSL).unwrap());
        assert!(validate_ssl_mode(SslMode::VerifyIdentity, capabilities::CLIENT_SSL).unwrap());
    }

    #[test]
    fn test_validate_tls_config() {
        let config = TlsConfig::new();
        for mode in [
            SslMode::Disable,
            SslMode::Preferred,
            SslMode::Required,
            SslMode::VerifyCa,
            SslMode::VerifyIdentity,
        ] {
            assert!(validate_tls_config(mode, &config).is_ok());
        }

        let cert_only = TlsConfig::new().client_cert("/path/to/client.pem");
        assert!(validate_tls_config(SslMode::VerifyCa, &cert_only).is_err());
        let key_only = TlsConfig::new().client_key("/path/to/client-key.pem");
        assert!(validate_tls_config(SslMode::Required, &key_only).is_err());
        // Ignored entirely when TLS is off.
        assert!(validate_tls_config(SslMode::Disable, &key_only).is_ok());

        let pair = TlsConfig::new()
            .ca_cert("/path/to/ca.pem")
            .client_cert("/path/to/client.pem")
            .client_key("/path/to/client-key.pem");
        assert!(validate_tls_config(SslMode::VerifyIdentity, &pair).is_ok());
    }

    #[test]
    #[cfg(not(feature = "tls"))]
    fn test_tls_without_feature_is_ssl_error() {
        let err = TlsStream::connect((), &TlsConfig::new(), "localhost", SslMode::Required)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Ssl
        ));
    }
}

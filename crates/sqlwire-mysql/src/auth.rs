//! MySQL authentication plugins.
//!
//! Each [`AuthPlugin`] turns the server's seed and the user's password into
//! the bytes of an auth response. Plugins that need more than one round
//! trip (`caching_sha2_password`, `sha256_password`, OS-integrated auth)
//! continue through [`AuthPlugin::continue_auth`] when the server sends an
//! auth-more-data packet.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast auth (if cached on server):
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```
//!
//! Full auth sends the password in clear over a secure channel, or RSA
//! encrypted with the server's public key otherwise.

use std::fmt;

use sha1::Sha1;
use sha2::{Digest, Sha256};

use rand::rngs::OsRng;

use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;

use sqlwire_core::error::ConnectionErrorKind;
use sqlwire_core::{Error, Result};

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication (legacy default)
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// SHA256-based authentication (MySQL 8.0+ default)
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    /// RSA-based SHA256 authentication
    pub const SHA256_PASSWORD: &str = "sha256_password";
    /// Password sent as-is; only acceptable over a secure channel
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
    /// Windows native authentication
    pub const AUTHENTICATION_WINDOWS_CLIENT: &str = "authentication_windows_client";
}

/// Response codes for caching_sha2_password protocol.
pub mod caching_sha2 {
    /// Request for public key (client should send 0x02)
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Fast auth success
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Full auth needed (switch to secure channel or RSA)
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// sha256_password asks for the server key with this single byte.
pub const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// Produces Windows authentication tokens.
///
/// The protocol driver only carries the opaque tokens between the server
/// and the provider; producing them needs the platform's security APIs,
/// which the caller supplies.
pub trait IntegratedAuthProvider: Send + Sync + fmt::Debug {
    /// Token for the initial handshake response.
    #[allow(clippy::result_large_err)]
    fn initial_token(&self, seed: &[u8]) -> Result<Vec<u8>>;

    /// Token answering a server challenge.
    #[allow(clippy::result_large_err)]
    fn next_token(&self, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// Inputs an [`AuthPlugin`] needs besides the seed.
#[derive(Clone, Copy)]
pub struct AuthContext<'a> {
    pub password: &'a str,
    /// The channel is TLS or a unix socket
    pub secure: bool,
    /// Send cleartext passwords over an insecure channel anyway
    pub allow_cleartext: bool,
    pub integrated: Option<&'a dyn IntegratedAuthProvider>,
}

impl fmt::Debug for AuthContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("secure", &self.secure)
            .field("allow_cleartext", &self.allow_cleartext)
            .field("integrated", &self.integrated.is_some())
            .finish_non_exhaustive()
    }
}

/// What to do after an auth-more-data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send these bytes as the next packet of the exchange
    Send(Vec<u8>),
    /// Nothing to send; the server's verdict follows
    Wait,
}

/// Authentication method negotiated with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    ClearPassword,
    CachingSha2Password,
    Sha256Password,
    /// OS-integrated (Windows) authentication
    Integrated,
}

impl AuthPlugin {
    /// Look up a plugin by its server-side name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD => Some(Self::NativePassword),
            plugins::MYSQL_CLEAR_PASSWORD => Some(Self::ClearPassword),
            plugins::CACHING_SHA2_PASSWORD => Some(Self::CachingSha2Password),
            plugins::SHA256_PASSWORD => Some(Self::Sha256Password),
            plugins::AUTHENTICATION_WINDOWS_CLIENT => Some(Self::Integrated),
            _ => None,
        }
    }

    /// Plugin name as sent in the handshake response.
    pub const fn name(self) -> &'static str {
        match self {
            Self::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            Self::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
            Self::CachingSha2Password => plugins::CACHING_SHA2_PASSWORD,
            Self::Sha256Password => plugins::SHA256_PASSWORD,
            Self::Integrated => plugins::AUTHENTICATION_WINDOWS_CLIENT,
        }
    }

    /// First auth response for `seed`.
    #[allow(clippy::result_large_err)]
    pub fn scramble(self, seed: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        let seed = trim_seed(seed);
        match self {
            Self::NativePassword => Ok(mysql_native_password(ctx.password, seed)),
            Self::CachingSha2Password => Ok(caching_sha2_password(ctx.password, seed)),
            Self::ClearPassword => {
                if !ctx.secure && !ctx.allow_cleartext {
                    return Err(auth_error(
                        "server requested mysql_clear_password over an insecure channel; \
                         enable TLS or allow_cleartext_password",
                    ));
                }
                Ok(nul_terminated(ctx.password))
            }
            Self::Sha256Password => {
                if ctx.password.is_empty() {
                    Ok(vec![0])
                } else if ctx.secure {
                    Ok(nul_terminated(ctx.password))
                } else {
                    Ok(vec![SHA256_REQUEST_PUBLIC_KEY])
                }
            }
            Self::Integrated => integrated_provider(ctx)?.initial_token(seed),
        }
    }

    /// React to an auth-more-data packet (its 0x01 prefix stripped).
    #[allow(clippy::result_large_err)]
    pub fn continue_auth(
        self,
        data: &[u8],
        seed: &[u8],
        ctx: &AuthContext<'_>,
    ) -> Result<AuthStep> {
        let seed = trim_seed(seed);
        match self {
            Self::CachingSha2Password => match data {
                [caching_sha2::FAST_AUTH_SUCCESS] => Ok(AuthStep::Wait),
                [caching_sha2::PERFORM_FULL_AUTH] => {
                    if ctx.secure {
                        Ok(AuthStep::Send(nul_terminated(ctx.password)))
                    } else {
                        Ok(AuthStep::Send(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
                    }
                }
                pem => sha256_password_rsa(ctx.password, seed, pem, true).map(AuthStep::Send),
            },
            Self::Sha256Password => {
                sha256_password_rsa(ctx.password, seed, data, true).map(AuthStep::Send)
            }
            Self::Integrated => integrated_provider(ctx)?
                .next_token(data)
                .map(AuthStep::Send),
            Self::NativePassword | Self::ClearPassword => Err(Error::protocol(format!(
                "unexpected auth-more-data packet for {}",
                self.name()
            ))),
        }
    }
}

fn integrated_provider<'a>(ctx: &AuthContext<'a>) -> Result<&'a dyn IntegratedAuthProvider> {
    ctx.integrated.ok_or_else(|| {
        auth_error("server requested Windows authentication but no provider is configured")
    })
}

fn nul_terminated(password: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(password.len() + 1);
    bytes.extend_from_slice(password.as_bytes());
    bytes.push(0);
    bytes
}

/// Seeds arrive with a trailing NUL from some servers.
fn trim_seed(seed: &[u8]) -> &[u8] {
    match seed {
        [rest @ .., 0] if rest.len() == 20 => rest,
        _ => seed,
    }
}

fn auth_error(message: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::Authentication, message)
}

/// Compute the mysql_native_password response.
///
/// An empty password yields no scramble bytes: the handshake response then
/// carries only the zero length marker, and an auth-switch reply is an
/// empty packet.
pub fn mysql_native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let seed = if auth_data.len() > 20 {
        &auth_data[..20]
    } else {
        auth_data
    };

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Compute the caching_sha2_password fast-auth response.
///
/// Returns an empty vec for an empty password.
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let seed = trim_seed(auth_data);

    let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Encrypt the password with the server's RSA public key.
///
/// The NUL-terminated password is XORed with the rotating seed first. MySQL
/// 8.0.5+ expects OAEP padding; `use_oaep = false` selects PKCS#1 v1.5 for
/// older servers.
#[allow(clippy::result_large_err)]
pub fn sha256_password_rsa(
    password: &str,
    seed: &[u8],
    public_key_pem: &[u8],
    use_oaep: bool,
) -> Result<Vec<u8>> {
    if seed.is_empty() {
        return Err(auth_error("RSA password exchange needs a non-empty seed"));
    }

    let mut pw = nul_terminated(password);
    for (i, b) in pw.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("server public key is not valid PEM: {e}")))?;

    let pub_key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_error(format!("failed to parse RSA public key: {e}")))?;

    let encrypted = if use_oaep {
        pub_key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &pw)
    } else {
        pub_key.encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, &pw)
    };
    encrypted.map_err(|e| auth_error(format!("RSA encryption failed: {e}")))
}

//! Authentication plugins and scramble algorithms.
//!
//! Four credential schemes cover every server this client talks to:
//! - `mysql_native_password`: SHA1 challenge/response (the default)
//! - `mysql_old_password`: the pre-4.1 scramble, only ever demanded by the
//!   server via a bare 0xFE response
//! - `sha256_password`: RSA-encrypted password (or cleartext under TLS)
//! - `caching_sha2_password`: SHA256 challenge/response with a full-auth
//!   fallback to the sha256 RSA exchange
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```

use sha1::Sha1;
use sha2::{Digest, Sha256};

use rand::rngs::OsRng;

use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;

use drizzle_core::{Error, ProtocolError, Result};

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication (legacy default)
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// Pre-4.1 scramble, requested via a bare 0xFE auth response
    pub const MYSQL_OLD_PASSWORD: &str = "mysql_old_password";
    /// SHA256-based authentication (MySQL 8.0+ default)
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    /// RSA-based SHA256 authentication
    pub const SHA256_PASSWORD: &str = "sha256_password";
}

/// Status bytes inside an AuthMoreData (0x01) packet for caching_sha2.
pub mod caching_sha2 {
    /// Fast auth succeeded; the final OK follows with nothing more sent
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Full auth needed (secure channel or RSA exchange)
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

const BEGIN_PUBLIC_KEY: &str = "-----BEGIN PUBLIC KEY-----";

/// The closed set of supported authentication plugins.
///
/// The protocol fixes this set; a server naming anything else in an auth
/// switch is a fatal protocol error rather than an extension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    Native,
    Old,
    Sha256,
    CachingSha2,
}

impl AuthPlugin {
    /// Select the plugin for the initial exchange from the greeting's
    /// advertised default. Unrecognized names fall back to native auth.
    pub fn for_greeting(name: &str) -> Self {
        match name {
            plugins::SHA256_PASSWORD => AuthPlugin::Sha256,
            plugins::CACHING_SHA2_PASSWORD => AuthPlugin::CachingSha2,
            _ => AuthPlugin::Native,
        }
    }

    /// Select the plugin a mid-handshake switch request names. Here an
    /// unknown name is fatal: the server demanded it, so there is no
    /// sensible fallback.
    pub fn for_switch(name: &str) -> Result<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD => Ok(AuthPlugin::Native),
            plugins::MYSQL_OLD_PASSWORD => Ok(AuthPlugin::Old),
            plugins::SHA256_PASSWORD => Ok(AuthPlugin::Sha256),
            plugins::CACHING_SHA2_PASSWORD => Ok(AuthPlugin::CachingSha2),
            other => Err(Error::Protocol(ProtocolError {
                message: format!("unknown authentication method {other}"),
                raw_data: None,
                source: None,
            })),
        }
    }

    /// The plugin name as it appears on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            AuthPlugin::Native => plugins::MYSQL_NATIVE_PASSWORD,
            AuthPlugin::Old => plugins::MYSQL_OLD_PASSWORD,
            AuthPlugin::Sha256 => plugins::SHA256_PASSWORD,
            AuthPlugin::CachingSha2 => plugins::CACHING_SHA2_PASSWORD,
        }
    }

    /// The name the client auth packet advertises for this plugin.
    ///
    /// The sha256 key exchange is not available during the initial packet,
    /// so that plugin advertises (and initially answers as) native auth;
    /// the RSA path only runs after an explicit switch.
    pub fn advertised_name(&self) -> &'static str {
        match self {
            AuthPlugin::CachingSha2 => plugins::CACHING_SHA2_PASSWORD,
            _ => plugins::MYSQL_NATIVE_PASSWORD,
        }
    }

    /// Credential bytes for the initial client auth packet.
    pub fn initial_scramble(&self, password: &str, seed: &[u8]) -> Vec<u8> {
        match self {
            AuthPlugin::CachingSha2 => caching_sha2_scramble(password, seed),
            AuthPlugin::Old => scramble_323(password, seed),
            // Sha256 answers the initial exchange with the native scramble
            _ => native_scramble(password, seed),
        }
    }

    /// Credential bytes for the packet answering an auth switch request,
    /// when they can be computed without further server round trips.
    /// The RSA full-auth path needs the public key and is driven by the
    /// connection instead; it returns `None` here.
    pub fn switch_response(&self, password: &str, seed: &[u8], ssl: bool) -> Option<Vec<u8>> {
        match self {
            AuthPlugin::Native => Some(native_scramble(password, seed)),
            AuthPlugin::Old => Some(scramble_323(password, seed)),
            AuthPlugin::CachingSha2 => Some(caching_sha2_scramble(password, seed)),
            AuthPlugin::Sha256 if ssl => Some(cleartext_password(password)),
            AuthPlugin::Sha256 => None,
        }
    }

    /// The one-byte request the client sends to fetch the server's RSA
    /// public key during full auth.
    pub fn public_key_request_code(&self) -> u8 {
        match self {
            AuthPlugin::CachingSha2 => 0x02,
            _ => 0x01,
        }
    }
}

/// Compute the `mysql_native_password` response.
///
/// Returns 20 bytes, or nothing for an empty password.
pub fn native_scramble(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    // Only the first 20 seed bytes participate
    let seed = if auth_data.len() > 20 {
        &auth_data[..20]
    } else {
        auth_data
    };

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1: [u8; 20] = hasher.finalize().into();

    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2: [u8; 20] = hasher.finalize().into();

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

/// Compute the `caching_sha2_password` fast-auth response.
///
/// Returns 32 bytes, or nothing for an empty password.
pub fn caching_sha2_scramble(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    // Servers send the 20-byte scramble with a trailing NUL
    let seed = if auth_data.len() == 21 && auth_data.last() == Some(&0) {
        &auth_data[..20]
    } else {
        auth_data
    };

    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let password_hash: [u8; 32] = hasher.finalize().into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash);
    let double_hash: [u8; 32] = hasher.finalize().into();

    let mut hasher = Sha256::new();
    hasher.update(double_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// NUL-terminated cleartext password, for sha256/caching_sha2 full auth
/// over an already-encrypted channel.
pub fn cleartext_password(password: &str) -> Vec<u8> {
    let mut bytes = password.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

/// The pre-4.1 password hash.
#[allow(clippy::cast_possible_truncation)]
fn hash_323(bytes: &[u8]) -> (u32, u32) {
    let mut nr: i64 = 1_345_345_333;
    let mut add: i64 = 7;
    let mut nr2: i64 = 0x1234_5671;

    for &c in bytes {
        if c == b' ' || c == b'\t' {
            continue;
        }
        let tmp = i64::from(c);
        nr ^= (((nr & 63) + add) * tmp).wrapping_add(nr << 8);
        nr2 = nr2.wrapping_add((nr2 << 8) ^ nr);
        add += tmp;
    }

    ((nr & 0x7FFF_FFFF) as u32, (nr2 & 0x7FFF_FFFF) as u32)
}

/// The pseudo-random stream the pre-4.1 scramble draws from.
struct Rand323 {
    seed1: u64,
    seed2: u64,
}

impl Rand323 {
    const MAX: u64 = 0x3FFF_FFFF;

    fn new(seed1: u32, seed2: u32) -> Self {
        Self {
            seed1: u64::from(seed1) % Self::MAX,
            seed2: u64::from(seed2) % Self::MAX,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn next(&mut self) -> f64 {
        self.seed1 = (self.seed1 * 3 + self.seed2) % Self::MAX;
        self.seed2 = (self.seed1 + self.seed2 + 33) % Self::MAX;
        self.seed1 as f64 / Self::MAX as f64
    }
}

/// Compute the pre-4.1 `mysql_old_password` response.
///
/// Only the first 8 seed bytes participate. Returns 8 printable bytes,
/// or nothing for an empty password.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn scramble_323(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let seed = if seed.len() > 8 { &seed[..8] } else { seed };

    let (pw1, pw2) = hash_323(password.as_bytes());
    let (sd1, sd2) = hash_323(seed);

    let mut rand = Rand323::new(pw1 ^ sd1, pw2 ^ sd2);

    let mut out: Vec<u8> = (0..seed.len())
        .map(|_| ((rand.next() * 31.0).floor() as u8) + 64)
        .collect();

    let extra = (rand.next() * 31.0).floor() as u8;
    for b in &mut out {
        *b ^= extra;
    }
    out
}

/// XOR the NUL-terminated password with the seed, cycled. This is the
/// plaintext the RSA full-auth exchange encrypts.
pub fn xor_with_seed(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() || seed.is_empty() {
        return vec![];
    }

    let mut bytes = cleartext_password(password);
    for (i, b) in bytes.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }
    bytes
}

/// Validate the PEM armor of a server-provided RSA public key.
///
/// The server hands the key back as ASCII armor; anything not starting
/// with the expected header is rejected outright.
pub fn validate_public_key_pem(pem: &[u8]) -> Result<&str> {
    let text = std::str::from_utf8(pem).map_err(|e| {
        Error::Protocol(ProtocolError {
            message: format!("server public key is not UTF-8: {e}"),
            raw_data: Some(pem.to_vec()),
            source: None,
        })
    })?;
    if !text.trim_start().starts_with(BEGIN_PUBLIC_KEY) {
        return Err(Error::Protocol(ProtocolError {
            message: "bad public key format from server".to_string(),
            raw_data: Some(pem.to_vec()),
            source: None,
        }));
    }
    Ok(text)
}

/// Encrypt the XOR-scrambled password with the server's RSA public key,
/// OAEP-padded. Both sha256_password and caching_sha2_password full auth
/// use this exchange.
pub fn rsa_encrypt_password(
    password: &str,
    seed: &[u8],
    public_key_pem: &[u8],
) -> Result<Vec<u8>> {
    let plaintext = xor_with_seed(password, seed);

    let pem = validate_public_key_pem(public_key_pem)?;

    let pub_key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| {
            Error::Protocol(ProtocolError {
                message: format!("failed to parse RSA public key: {e}"),
                raw_data: None,
                source: None,
            })
        })?;

    pub_key
        .encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plaintext)
        .map_err(|e| {
            Error::Protocol(ProtocolError {
                message: format!("RSA encryption failed: {e}"),
                raw_data: None,
                source: None,
            })
        })
}

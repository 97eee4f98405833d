//! SSL upgrade support.
//!
//! The upgrade happens mid-handshake: after reading the server greeting
//! the client sends an abbreviated SSL request packet (capability flags
//! with the SSL bit, max packet size, charset, 23 reserved zeros), runs
//! the TLS handshake on the raw socket, and then continues the protocol
//! exchange over the encrypted stream.
//!
//! Requires the `tls` feature; without it the upgrade path returns an
//! error naming the missing feature.

#![allow(clippy::cast_possible_truncation)]

use drizzle_core::Error;
use drizzle_core::error::{ConnectionError, ConnectionErrorKind};

use crate::config::MySqlConfig;
use crate::protocol::{PacketWriter, capabilities};

#[cfg(feature = "tls")]
use std::io::{Read, Write};
#[cfg(feature = "tls")]
use std::sync::Arc;

/// Build the abbreviated SSL request packet sent before the TLS
/// handshake. 32 payload bytes.
pub fn build_ssl_request_packet(
    client_caps: u32,
    max_packet_size: u32,
    character_set: u8,
    sequence_id: u8,
) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    writer.write_u32_le(client_caps | capabilities::CLIENT_SSL);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(character_set);
    writer.write_zeros(23);
    writer.build_packet(sequence_id)
}

/// Whether the greeting advertised SSL support.
pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Fail if the configuration demands SSL but the server cannot do it.
#[allow(clippy::result_large_err)]
pub fn require_ssl_support(server_caps: u32) -> Result<(), Error> {
    if server_supports_ssl(server_caps) {
        Ok(())
    } else {
        Err(tls_error("SSL requested but the server does not support it"))
    }
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

/// An encrypted stream over a connected socket.
#[cfg(feature = "tls")]
pub struct TlsStream<S: Read + Write> {
    conn: rustls::ClientConnection,
    stream: S,
}

#[cfg(feature = "tls")]
impl<S: Read + Write> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .field("is_handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> TlsStream<S> {
    /// Wrap `stream` and run the TLS handshake to completion.
    #[allow(clippy::result_large_err)]
    pub fn new(mut stream: S, config: &MySqlConfig) -> Result<Self, Error> {
        let client_config = build_client_config(config)?;

        let server_name = config
            .host
            .clone()
            .try_into()
            .map_err(|e| tls_error(format!("invalid server name '{}': {e}", config.host)))?;

        let mut conn = rustls::ClientConnection::new(Arc::new(client_config), server_name)
            .map_err(|e| tls_error(format!("failed to create TLS connection: {e}")))?;

        while conn.is_handshaking() {
            while conn.wants_write() {
                conn.write_tls(&mut stream)
                    .map_err(|e| tls_error(format!("TLS handshake write error: {e}")))?;
            }
            if conn.wants_read() {
                conn.read_tls(&mut stream)
                    .map_err(|e| tls_error(format!("TLS handshake read error: {e}")))?;
                conn.process_new_packets()
                    .map_err(|e| tls_error(format!("TLS handshake error: {e}")))?;
            }
        }

        Ok(TlsStream { conn, stream })
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }

    pub fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        self.conn.negotiated_cipher_suite()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if self.conn.wants_read() {
                let n = self.conn.read_tls(&mut self.stream)?;
                if n == 0 {
                    return Ok(0);
                }
                self.conn
                    .process_new_packets()
                    .map_err(|e| std::io::Error::other(format!("TLS error: {e}")))?;
            } else {
                return Ok(0);
            }
        }
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.conn.writer().flush()?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        self.stream.flush()
    }
}

/// Translate the configured protocol names into rustls versions. An
/// empty list offers both 1.2 and 1.3.
#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn select_protocol_versions(
    names: &[String],
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, Error> {
    if names.is_empty() {
        return Ok(vec![&rustls::version::TLS12, &rustls::version::TLS13]);
    }

    let mut versions = Vec::with_capacity(names.len());
    for name in names {
        match name.as_str() {
            "TLSv1.2" => versions.push(&rustls::version::TLS12),
            "TLSv1.3" => versions.push(&rustls::version::TLS13),
            other => {
                return Err(tls_error(format!("unsupported TLS protocol '{other}'")));
            }
        }
    }
    Ok(versions)
}

/// Build the crypto provider, restricted to the configured cipher suites
/// when any are named.
#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn build_provider(suite_names: &[String]) -> Result<rustls::crypto::CryptoProvider, Error> {
    let mut provider = rustls::crypto::ring::default_provider();

    if !suite_names.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            suite_names.iter().any(|wanted| wanted == &name)
        });
        if provider.cipher_suites.is_empty() {
            return Err(tls_error(
                "none of the configured cipher suites are supported",
            ));
        }
    }

    Ok(provider)
}

/// Build the rustls client configuration from the connection settings.
#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn build_client_config(config: &MySqlConfig) -> Result<rustls::ClientConfig, Error> {
    let provider = Arc::new(build_provider(&config.enabled_cipher_suites)?);
    let versions = select_protocol_versions(&config.enabled_protocols)?;

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)
        .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?;

    if config.danger_skip_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth());
    }

    let root_store = match &config.server_certificate {
        Some(ca_path) => load_custom_roots(ca_path)?,
        None => {
            let mut store = rustls::RootCertStore::empty();
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            store
        }
    };

    Ok(builder
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn load_custom_roots(ca_path: &std::path::Path) -> Result<rustls::RootCertStore, Error> {
    use std::fs::File;
    use std::io::BufReader;

    let ca_file = File::open(ca_path).map_err(|e| {
        tls_error(format!(
            "failed to open CA certificate '{}': {e}",
            ca_path.display()
        ))
    })?;
    let mut reader = BufReader::new(ca_file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse CA certificate: {e}")))?;

    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates found in '{}'",
            ca_path.display()
        )));
    }

    let mut store = rustls::RootCertStore::empty();
    for cert in certs {
        store
            .add(cert)
            .map_err(|e| tls_error(format!("failed to add CA certificate: {e}")))?;
    }
    Ok(store)
}

/// Accepts any server certificate. Gated behind `danger_skip_verify`.
#[cfg(feature = "tls")]
#[derive(Debug)]
struct NoVerifier;

#[cfg(feature = "tls")]
impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Placeholder when the `tls` feature is disabled.
#[cfg(not(feature = "tls"))]
#[derive(Debug)]
pub struct TlsStream<S> {
    #[allow(dead_code)]
    inner: S,
}

#[cfg(not(feature = "tls"))]
impl<S> TlsStream<S> {
    /// Always errors; enable the `tls` feature for SSL connections.
    #[allow(unused_variables, clippy::result_large_err)]
    pub fn new(stream: S, config: &MySqlConfig) -> Result<Self, Error> {
        Err(tls_error(
            "SSL requires the 'tls' feature. \
             Add `drizzle-mysql = { features = [\"tls\"] }` to your Cargo.toml.",
        ))
    }
}

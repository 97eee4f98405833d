//! Handshake packet parsing and construction.
//!
//! The server opens with a protocol v10 greeting carrying its version,
//! the connection's thread id, the auth seed (split across two fields),
//! capability flags (also split), and the default auth plugin name. The
//! client answers with an auth packet, possibly preceded by an
//! abbreviated SSL request. This module only parses and builds payloads;
//! the connection drives the exchange.

use drizzle_core::error::ProtocolError;
use drizzle_core::{Error, Result};

use crate::auth;
use crate::protocol::{PacketReader, PacketWriter, capabilities};

/// Parsed server greeting.
#[derive(Debug, Clone)]
pub struct Greeting {
    /// Protocol version, always 10
    pub protocol_version: u8,
    /// Server version string
    pub server_version: String,
    /// Thread id of this connection on the server, used by KILL
    pub thread_id: u32,
    /// Full auth seed (both parts, trailing NUL stripped)
    pub seed: Vec<u8>,
    /// Server capability flags
    pub capabilities: u32,
    /// Server default charset
    pub charset: u8,
    /// Server status flags
    pub status_flags: u16,
    /// Default auth plugin name
    pub auth_plugin: String,
}

/// Parse the server greeting payload.
#[allow(clippy::result_large_err)]
pub fn parse_greeting(payload: &[u8]) -> Result<Greeting> {
    let mut reader = PacketReader::new(payload);

    let protocol_version = reader
        .read_u8()
        .ok_or_else(|| greeting_error("protocol version", payload))?;
    if protocol_version != 10 {
        return Err(Error::Protocol(ProtocolError {
            message: format!("unsupported protocol version {protocol_version}"),
            raw_data: Some(payload.to_vec()),
            source: None,
        }));
    }

    let server_version = reader
        .read_null_string()
        .ok_or_else(|| greeting_error("server version", payload))?;
    let thread_id = reader
        .read_u32_le()
        .ok_or_else(|| greeting_error("thread id", payload))?;

    // Seed part 1 (8 bytes) then a filler byte
    let seed_part1 = reader
        .read_bytes(8)
        .ok_or_else(|| greeting_error("auth seed", payload))?
        .to_vec();
    reader.skip(1);

    let caps_lower = reader
        .read_u16_le()
        .ok_or_else(|| greeting_error("capability flags", payload))?;
    let charset = reader.read_u8().unwrap_or(0);
    let status_flags = reader.read_u16_le().unwrap_or(0);
    let caps_upper = reader.read_u16_le().unwrap_or(0);
    let server_caps = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

    let auth_data_len = if server_caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_u8().unwrap_or(0) as usize
    } else {
        reader.skip(1);
        0
    };

    // 10 reserved bytes
    reader.skip(10);

    let mut seed = seed_part1;
    if server_caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let len2 = if auth_data_len > 8 {
            auth_data_len - 8
        } else {
            13
        };
        if let Some(part2) = reader.read_bytes(len2.min(reader.remaining())) {
            let trimmed = if part2.last() == Some(&0) {
                &part2[..part2.len() - 1]
            } else {
                part2
            };
            seed.extend_from_slice(trimmed);
        }
    }

    let auth_plugin = if server_caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_null_string().unwrap_or_default()
    } else {
        auth::plugins::MYSQL_NATIVE_PASSWORD.to_string()
    };

    Ok(Greeting {
        protocol_version,
        server_version,
        thread_id,
        seed,
        capabilities: server_caps,
        charset,
        status_flags,
        auth_plugin,
    })
}

/// Build the client auth packet payload.
#[allow(clippy::cast_possible_truncation)]
pub fn build_client_auth(
    client_caps: u32,
    max_packet_size: u32,
    charset: u8,
    user: &str,
    credential: &[u8],
    database: Option<&str>,
    plugin_name: &str,
) -> Vec<u8> {
    let mut writer = PacketWriter::new();

    writer.write_u32_le(client_caps);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(charset);
    writer.write_zeros(23);
    writer.write_null_string(user);

    if client_caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        writer.write_lenenc_bytes(credential);
    } else if client_caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        // Credentials are at most 32 bytes across all plugins
        writer.write_u8(credential.len() as u8);
        writer.write_bytes(credential);
    } else {
        writer.write_bytes(credential);
        writer.write_u8(0);
    }

    if client_caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        match database {
            Some(db) => writer.write_null_string(db),
            None => writer.write_u8(0),
        }
    }

    if client_caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        writer.write_null_string(plugin_name);
    }

    writer.into_bytes()
}

/// A parsed auth switch request (the 0xFE packet during authentication).
#[derive(Debug)]
pub enum AuthSwitch {
    /// Bare 0xFE: the server demands the pre-4.1 credential
    OldPassword,
    /// Named plugin switch with a fresh seed
    Plugin { name: String, seed: Vec<u8> },
}

/// Parse an auth switch payload (everything after the 0xFE marker).
pub fn parse_auth_switch(data: &[u8]) -> AuthSwitch {
    if data.is_empty() {
        return AuthSwitch::OldPassword;
    }

    let mut reader = PacketReader::new(data);
    let name = reader.read_null_string().unwrap_or_default();
    let mut seed = reader.read_rest().to_vec();
    if seed.last() == Some(&0) {
        seed.pop();
    }
    AuthSwitch::Plugin { name, seed }
}

fn greeting_error(field: &str, payload: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("greeting truncated at {field}"),
        raw_data: Some(payload.to_vec()),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_greeting(caps: u32, seed: &[u8; 20], plugin: &str) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("5.5.5-10.6.12-MariaDB");
        w.write_u32_le(1234);
        w.write_bytes(&seed[..8]);
        w.write_u8(0); // filler
        w.write_u16_le((caps & 0xFFFF) as u16);
        w.write_u8(33);
        w.write_u16_le(0x0002);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21); // auth data length
        w.write_zeros(10);
        w.write_bytes(&seed[8..]);
        w.write_u8(0); // seed terminator
        w.write_null_string(plugin);
        w.into_bytes()
    }

    const FULL_CAPS: u32 = capabilities::CLIENT_PROTOCOL_41
        | capabilities::CLIENT_SECURE_CONNECTION
        | capabilities::CLIENT_PLUGIN_AUTH;

    #[test]
    fn test_parse_greeting() {
        let seed = *b"abcdefgh0123456789AB";
        let payload = encode_greeting(FULL_CAPS, &seed, "mysql_native_password");
        let greeting = parse_greeting(&payload).unwrap();

        assert_eq!(greeting.protocol_version, 10);
        assert_eq!(greeting.server_version, "5.5.5-10.6.12-MariaDB");
        assert_eq!(greeting.thread_id, 1234);
        assert_eq!(greeting.seed, seed.to_vec());
        assert_eq!(greeting.capabilities, FULL_CAPS);
        assert_eq!(greeting.auth_plugin, "mysql_native_password");
        assert_eq!(greeting.charset, 33);
    }

    #[test]
    fn test_parse_greeting_rejects_wrong_version() {
        let mut payload = encode_greeting(FULL_CAPS, b"abcdefgh0123456789AB", "x");
        payload[0] = 9;
        assert!(parse_greeting(&payload).is_err());
    }

    #[test]
    fn test_parse_greeting_truncated() {
        let payload = encode_greeting(FULL_CAPS, b"abcdefgh0123456789AB", "x");
        assert!(parse_greeting(&payload[..10]).is_err());
    }

    #[test]
    fn test_build_client_auth_layout() {
        let caps = capabilities::BASE_CLIENT_FLAGS | capabilities::CLIENT_CONNECT_WITH_DB;
        let credential = [0xAA; 20];
        let payload = build_client_auth(
            caps,
            1 << 24,
            33,
            "app",
            &credential,
            Some("mydb"),
            "mysql_native_password",
        );

        // caps
        assert_eq!(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]), caps);
        // max packet
        assert_eq!(
            u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]),
            1 << 24
        );
        assert_eq!(payload[8], 33);
        // 23 reserved zeros
        assert!(payload[9..32].iter().all(|&b| b == 0));
        // user
        assert_eq!(&payload[32..36], b"app\0");
        // length-prefixed credential
        assert_eq!(payload[36], 20);
        assert_eq!(&payload[37..57], &credential);
        // database then plugin name
        assert_eq!(&payload[57..62], b"mydb\0");
        assert_eq!(&payload[62..], b"mysql_native_password\0");
    }

    #[test]
    fn test_build_client_auth_empty_credential() {
        let payload = build_client_auth(
            capabilities::BASE_CLIENT_FLAGS,
            1 << 24,
            33,
            "app",
            &[],
            None,
            "mysql_native_password",
        );
        // Zero-length credential encodes as a single 0 byte
        assert_eq!(payload[36], 0);
        assert_eq!(&payload[37..], b"mysql_native_password\0");
    }

    #[test]
    fn test_parse_auth_switch_old_password() {
        assert!(matches!(parse_auth_switch(&[]), AuthSwitch::OldPassword));
    }

    #[test]
    fn test_parse_auth_switch_named_plugin() {
        let mut data = b"mysql_native_password\0".to_vec();
        data.extend_from_slice(b"newseed8bytes plus more\0");
        match parse_auth_switch(&data) {
            AuthSwitch::Plugin { name, seed } => {
                assert_eq!(name, "mysql_native_password");
                assert_eq!(seed, b"newseed8bytes plus more".to_vec());
            }
            AuthSwitch::OldPassword => panic!("expected plugin switch"),
        }
    }
}

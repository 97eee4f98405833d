//! MySQL/Drizzle wire protocol primitives.
//!
//! Packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum packet payload is 2^24 - 1. Larger payloads are split
//! across continuation packets.

pub mod batch;
pub mod reader;
pub mod writer;

pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Maximum payload size for a single packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;

    /// Capabilities every connection asks for before config adjustments.
    pub const BASE_CLIENT_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_TRANSACTIONS
        | CLIENT_PLUGIN_AUTH;
}

/// Command codes sent as the first payload byte of a command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Close the connection
    Quit = 0x01,
    /// Switch the default database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Ping the server
    Ping = 0x0e,
    /// Request a binlog stream
    BinlogDump = 0x12,
}

/// Server status flags carried in OK and EOF packets.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
}

/// Character set codes.
#[allow(dead_code)]
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;

    /// Default charset for new connections (utf8).
    pub const DEFAULT_CHARSET: u8 = UTF8_GENERAL_CI;
}

/// A packet header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 2^24 - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        let sequence_id = bytes[3];
        Self {
            payload_length,
            sequence_id,
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }
}

/// Where in the exchange a packet arrived.
///
/// A leading 0xFE byte is ambiguous on its own: during authentication it
/// announces an auth switch (or, with an empty payload, a demand for the
/// pre-4.1 credential), while in a result stream it is the end-of-rows
/// terminator. Classification therefore needs both the first byte and
/// the phase the connection is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketContext {
    /// Handshake and authentication exchange
    Handshake,
    /// Query responses and row streams
    ResultSet,
}

/// Server response packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// End-of-rows terminator (0xFE, short payload, result context)
    Eof,
    /// Auth switch request (0xFE during the handshake)
    AuthSwitch,
    /// Additional auth data from the selected plugin (0x01 during the handshake)
    AuthMoreData,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Data packet (column definition, row, auth payload)
    Data,
}

impl PacketType {
    /// Classify a packet from its first byte, payload length and context.
    pub fn classify(byte: u8, payload_len: u32, context: PacketContext) -> Self {
        match (byte, context) {
            (0x00, _) => PacketType::Ok,
            (0xFF, _) => PacketType::Error,
            (0xFE, PacketContext::Handshake) => PacketType::AuthSwitch,
            // EOF is 0xFE with payload < 9 bytes
            (0xFE, PacketContext::ResultSet) if payload_len < 9 => PacketType::Eof,
            (0x01, PacketContext::Handshake) => PacketType::AuthMoreData,
            (0xFB, PacketContext::ResultSet) => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Info string (if any)
    pub info: String,
}

/// Parsed Error packet.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
}

impl EofPacket {
    /// More result sets follow the one this packet terminated.
    pub fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_roundtrip() {
        let header = PacketHeader {
            payload_length: 0x0012_3456,
            sequence_id: 7,
        };
        let bytes = header.to_bytes();
        let parsed = PacketHeader::from_bytes(&bytes);
        assert_eq!(header.payload_length, parsed.payload_length);
        assert_eq!(header.sequence_id, parsed.sequence_id);
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn test_packet_header_max_size() {
        let header = PacketHeader {
            payload_length: MAX_PACKET_SIZE as u32,
            sequence_id: 255,
        };
        assert_eq!(header.to_bytes(), [0xFF, 0xFF, 0xFF, 255]);
    }

    #[test]
    fn test_classify_result_context() {
        let ctx = PacketContext::ResultSet;
        assert_eq!(PacketType::classify(0x00, 10, ctx), PacketType::Ok);
        assert_eq!(PacketType::classify(0xFF, 10, ctx), PacketType::Error);
        assert_eq!(PacketType::classify(0xFE, 5, ctx), PacketType::Eof);
        assert_eq!(PacketType::classify(0xFE, 100, ctx), PacketType::Data);
        assert_eq!(PacketType::classify(0xFB, 10, ctx), PacketType::LocalInfile);
        assert_eq!(PacketType::classify(0x42, 10, ctx), PacketType::Data);
        // 0x01 only means auth continuation during the handshake
        assert_eq!(PacketType::classify(0x01, 10, ctx), PacketType::Data);
    }

    #[test]
    fn test_classify_handshake_context() {
        let ctx = PacketContext::Handshake;
        assert_eq!(PacketType::classify(0x00, 7, ctx), PacketType::Ok);
        assert_eq!(PacketType::classify(0xFF, 20, ctx), PacketType::Error);
        // 0xFE during auth is a switch request whatever the length
        assert_eq!(PacketType::classify(0xFE, 1, ctx), PacketType::AuthSwitch);
        assert_eq!(PacketType::classify(0xFE, 30, ctx), PacketType::AuthSwitch);
        assert_eq!(
            PacketType::classify(0x01, 2, ctx),
            PacketType::AuthMoreData
        );
    }

    #[test]
    fn test_eof_more_results_flag() {
        let eof = EofPacket {
            warnings: 0,
            status_flags: server_status::SERVER_MORE_RESULTS_EXISTS,
        };
        assert!(eof.more_results());

        let done = EofPacket {
            warnings: 0,
            status_flags: server_status::SERVER_STATUS_AUTOCOMMIT,
        };
        assert!(!done.more_results());
    }
}

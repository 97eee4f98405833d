//! MySQL/Drizzle wire-protocol driver.
//!
//! This crate implements the client side of the MySQL protocol from
//! scratch over standard TCP. It provides:
//!
//! - Packet framing with sequence numbers and continuation packets
//! - Authentication (mysql_native_password, mysql_old_password,
//!   sha256_password, caching_sha2_password)
//! - Text protocol queries with `?` parameter interpolation
//! - Multi-statement batches framed as a single command
//! - Query cancellation and timeouts via a second connection
//! - SSL upgrade mid-handshake (feature `tls`)
//! - Type conversion between wire values and [`drizzle_core::Value`]
//!
//! # Protocol Overview
//!
//! Packets carry a 3-byte payload length plus a 1-byte sequence number.
//! Payloads over 2^24 - 1 bytes are split across continuation packets,
//! and a payload landing exactly on the limit is followed by an empty
//! terminator packet.
//!
//! # Example
//!
//! ```rust,ignore
//! use drizzle_mysql::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(config)?;
//! let rows = conn.query_rows("SELECT id, name FROM users WHERE id = ?", &[1i32.into()])?;
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod protocol;
pub mod query;
pub mod result;
pub mod tls;
pub mod types;

pub use cache::StatementCache;
pub use config::{MySqlConfig, ProxyProtocolConfig, ProxyTcpVersion};
pub use connection::{CancelHandle, ConnectionState, MySqlConnection};
pub use query::{Batch, Query};
pub use result::{ColumnDef, QueryResult, RowSet, UpdateResult};
pub use types::FieldType;

pub use drizzle_core::{Error, Result, Row, Value};

//! Core types for the Drizzle/MySQL wire-protocol client.
//!
//! This crate provides the vocabulary shared by protocol drivers:
//!
//! - `Value` for dynamically-typed SQL values
//! - `Row` and `ColumnInfo` for decoded result sets
//! - `Error` and `Result` for the client error taxonomy

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConnectionError, ConnectionErrorKind, Error, ProtocolError, QueryError, QueryErrorKind, Result,
    ServerError, TypeError,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;

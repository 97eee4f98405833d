//! Query and batch data model.

use std::collections::VecDeque;
use std::sync::OnceLock;

/// A single query, stored as the UTF-8 bytes that go on the wire.
///
/// The string form is derived lazily; a query built from bytes never pays
/// for the conversion unless someone asks for the text.
#[derive(Debug)]
pub struct Query {
    bytes: Vec<u8>,
    text: OnceLock<String>,
}

impl Query {
    pub fn new(sql: &str) -> Self {
        let text = OnceLock::new();
        let _ = text.set(sql.to_string());
        Self {
            bytes: sql.as_bytes().to_vec(),
            text,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            text: OnceLock::new(),
        }
    }

    /// Length of the encoded query in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The query text, decoded on first access.
    pub fn text(&self) -> &str {
        self.text
            .get_or_init(|| String::from_utf8_lossy(&self.bytes).into_owned())
    }
}

impl Clone for Query {
    fn clone(&self) -> Self {
        Self::from_bytes(self.bytes.clone())
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Query {}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Query::new(sql)
    }
}

impl From<String> for Query {
    fn from(sql: String) -> Self {
        Query::from_bytes(sql.into_bytes())
    }
}

/// A queue of queries sent as one multi-statement command.
///
/// The running total tracks the eventual payload size: every query's bytes
/// plus one separator between adjacent queries. The queue is drained
/// destructively when the batch is framed onto the wire.
#[derive(Debug, Default)]
pub struct Batch {
    queries: VecDeque<Query>,
    payload_len: u64,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a query, updating the payload total.
    pub fn add(&mut self, query: Query) {
        if !self.queries.is_empty() {
            self.payload_len += 1; // separator
        }
        self.payload_len += query.len() as u64;
        self.queries.push_back(query);
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Total payload bytes the framed batch will occupy, separators
    /// included and the command byte excluded.
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    pub fn front(&self) -> Option<&Query> {
        self.queries.front()
    }

    pub fn pop_front(&mut self) -> Option<Query> {
        self.queries.pop_front()
    }

    /// Drop any remaining queries and zero the total.
    pub fn clear(&mut self) {
        self.queries.clear();
        self.payload_len = 0;
    }
}

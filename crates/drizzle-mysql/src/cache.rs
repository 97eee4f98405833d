//! Shared statement text cache.
//!
//! Comment stripping walks the whole query string, so connections that
//! enable it share a cache mapping raw query text to the stripped form.
//! The cache is injected into connections rather than owned by them; one
//! instance can back a whole pool.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A concurrent map from raw query text to its processed form.
///
/// Insertion is first-writer-wins: when two threads race on the same key,
/// both end up holding the same `Arc`.
#[derive(Debug, Default)]
pub struct StatementCache {
    entries: RwLock<HashMap<String, Arc<str>>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.entries.write() {
            map.clear();
        }
    }

    /// Look up a cached entry.
    pub fn get(&self, sql: &str) -> Option<Arc<str>> {
        self.entries.read().ok()?.get(sql).cloned()
    }

    /// Fetch the entry for `sql`, computing and inserting it on a miss.
    /// On a racing insert the earlier value wins and is returned.
    pub fn get_or_insert_with<F>(&self, sql: &str, compute: F) -> Arc<str>
    where
        F: FnOnce() -> String,
    {
        if let Some(hit) = self.get(sql) {
            return hit;
        }

        let computed: Arc<str> = Arc::from(compute());
        match self.entries.write() {
            Ok(mut map) => map
                .entry(sql.to_string())
                .or_insert(computed)
                .clone(),
            // Poisoned lock: serve the computed value without caching
            Err(_) => computed,
        }
    }
}

/// Strip comments from query text.
///
/// Handles `/* ... */` blocks, `-- ` line comments (the double dash must
/// be followed by whitespace or end the line), and `#` line comments.
/// Comment openers inside string literals, double-quoted strings, or
/// backtick identifiers are left untouched.
pub fn strip_comments(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\'' | b'"' | b'`' => {
                let quote = b;
                let start = i;
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                let end = i.min(bytes.len());
                out.push_str(&sql[start..end]);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() {
                    if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && matches!(bytes.get(i + 2), None | Some(b' ' | b'\t' | b'\n' | b'\r')) =>
            {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            _ => {
                // Copy one UTF-8 scalar, not one byte
                let ch_len = utf8_len(b);
                let end = (i + ch_len).min(bytes.len());
                out.push_str(&sql[i..end]);
                i = end;
            }
        }
    }

    out
}

const fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_insert_and_hit() {
        let cache = StatementCache::new();
        assert!(cache.is_empty());

        let a = cache.get_or_insert_with("SELECT 1", || "SELECT 1".to_string());
        let b = cache.get_or_insert_with("SELECT 1", || panic!("should be cached"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_clear() {
        let cache = StatementCache::new();
        cache.get_or_insert_with("SELECT 1", || "SELECT 1".to_string());
        cache.clear();
        assert!(cache.get("SELECT 1").is_none());
    }

    #[test]
    fn test_cache_shared_across_threads() {
        let cache = Arc::new(StatementCache::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                cache.get_or_insert_with("SELECT x FROM t", || "SELECT x FROM t".to_string())
            }));
        }
        let values: Vec<Arc<str>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Every thread got the same entry
        for v in &values[1..] {
            assert!(Arc::ptr_eq(&values[0], v));
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_strip_block_comments() {
        assert_eq!(
            strip_comments("SELECT /* hidden */ 1"),
            "SELECT  1"
        );
        assert_eq!(strip_comments("/* lead */SELECT 1"), "SELECT 1");
        // Unterminated block swallows the rest
        assert_eq!(strip_comments("SELECT 1 /* oops"), "SELECT 1 ");
    }

    #[test]
    fn test_strip_line_comments() {
        assert_eq!(
            strip_comments("SELECT 1 -- trailing\nFROM t"),
            "SELECT 1 \nFROM t"
        );
        assert_eq!(strip_comments("SELECT 1 # note"), "SELECT 1 ");
        // A double dash not followed by whitespace is an expression
        assert_eq!(strip_comments("SELECT 1--2"), "SELECT 1--2");
    }

    #[test]
    fn test_strip_preserves_literals() {
        assert_eq!(
            strip_comments("SELECT '-- not a comment' FROM t"),
            "SELECT '-- not a comment' FROM t"
        );
        assert_eq!(
            strip_comments("SELECT `weird/*name*/` FROM t"),
            "SELECT `weird/*name*/` FROM t"
        );
        assert_eq!(
            strip_comments("SELECT \"#hash\" FROM t"),
            "SELECT \"#hash\" FROM t"
        );
    }

    #[test]
    fn test_strip_handles_escapes_in_strings() {
        assert_eq!(
            strip_comments(r"SELECT 'it\'s -- fine' FROM t"),
            r"SELECT 'it\'s -- fine' FROM t"
        );
    }

    #[test]
    fn test_cache_with_stripping() {
        let cache = StatementCache::new();
        let raw = "SELECT 1 /* c */";
        let stripped = cache.get_or_insert_with(raw, || strip_comments(raw));
        assert_eq!(&*stripped, "SELECT 1 ");
        // Second access reuses the stripped form
        let again = cache.get_or_insert_with(raw, || unreachable!());
        assert!(Arc::ptr_eq(&stripped, &again));
    }
}

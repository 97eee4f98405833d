//! Connection configuration.
//!
//! Builder-style settings covering the target server, credentials, SSL,
//! multi-statement behavior, and the proxy-protocol preamble.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::{capabilities, charset};

/// Address family for the proxy-protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyTcpVersion {
    #[default]
    V4,
    V6,
}

/// Settings for the proxy-protocol v1 preamble.
///
/// When configured, the client sends a single human-readable header line
/// before the server greeting so an intermediary (or a server that expects
/// it) learns the original client address.
#[derive(Debug, Clone)]
pub struct ProxyProtocolConfig {
    /// TCP4 or TCP6
    pub tcp_version: ProxyTcpVersion,
    /// Address of the originating client
    pub client_addr: String,
    /// Address the connection is proxied to
    pub proxied_addr: String,
    /// Originating client port
    pub client_port: u16,
    /// Destination port
    pub proxied_port: u16,
}

impl ProxyProtocolConfig {
    /// Render the v1 header line, CRLF terminated.
    pub fn header(&self) -> String {
        let family = match self.tcp_version {
            ProxyTcpVersion::V4 => "TCP4",
            ProxyTcpVersion::V6 => "TCP6",
        };
        format!(
            "PROXY {} {} {} {} {}\r\n",
            family, self.client_addr, self.proxied_addr, self.client_port, self.proxied_port
        )
    }
}

/// MySQL/Drizzle connection configuration.
#[derive(Debug, Clone)]
pub struct MySqlConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Username
    pub user: String,
    /// Password
    pub password: Option<String>,
    /// Database to select at connect time
    pub database: Option<String>,
    /// Character set code
    pub charset: u8,
    /// Timeout for connect and handshake I/O
    pub connect_timeout: Duration,
    /// Upgrade to SSL after the greeting
    pub use_ssl: bool,
    /// CA certificate used to verify the server; `None` means the
    /// standard root bundle
    pub server_certificate: Option<PathBuf>,
    /// Skip certificate verification entirely
    pub danger_skip_verify: bool,
    /// TLS protocol versions to offer ("TLSv1.2", "TLSv1.3"); empty
    /// means both
    pub enabled_protocols: Vec<String>,
    /// Cipher suite names to allow; empty means the provider default
    pub enabled_cipher_suites: Vec<String>,
    /// RSA public key file for sha256 auth without SSL; `None` fetches
    /// the key from the server
    pub server_public_key: Option<PathBuf>,
    /// Allow multiple statements per query string
    pub allow_multi_queries: bool,
    /// Report rows actually changed rather than rows matched
    pub use_affected_rows: bool,
    /// Strip comments from query text before sending
    pub strip_query_comments: bool,
    /// Create the configured database if it does not exist
    pub create_db: bool,
    /// Proxy-protocol preamble, if any
    pub proxy_protocol: Option<ProxyProtocolConfig>,
    /// Max packet size advertised to the server
    pub max_packet_size: u32,
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT_CHARSET,
            connect_timeout: Duration::from_secs(30),
            use_ssl: false,
            server_certificate: None,
            danger_skip_verify: false,
            enabled_protocols: Vec::new(),
            enabled_cipher_suites: Vec::new(),
            server_public_key: None,
            allow_multi_queries: false,
            use_affected_rows: false,
            strip_query_comments: false,
            create_db: false,
            proxy_protocol: None,
            max_packet_size: 16 * 1024 * 1024,
        }
    }
}

impl MySqlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn use_ssl(mut self, enabled: bool) -> Self {
        self.use_ssl = enabled;
        self
    }

    pub fn server_certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_certificate = Some(path.into());
        self
    }

    /// Disable certificate verification. Only for test setups.
    pub fn danger_skip_verify(mut self, enabled: bool) -> Self {
        self.danger_skip_verify = enabled;
        self
    }

    pub fn enabled_protocols(mut self, protocols: Vec<String>) -> Self {
        self.enabled_protocols = protocols;
        self
    }

    pub fn enabled_cipher_suites(mut self, suites: Vec<String>) -> Self {
        self.enabled_cipher_suites = suites;
        self
    }

    pub fn server_public_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_public_key = Some(path.into());
        self
    }

    pub fn allow_multi_queries(mut self, enabled: bool) -> Self {
        self.allow_multi_queries = enabled;
        self
    }

    pub fn use_affected_rows(mut self, enabled: bool) -> Self {
        self.use_affected_rows = enabled;
        self
    }

    pub fn strip_query_comments(mut self, enabled: bool) -> Self {
        self.strip_query_comments = enabled;
        self
    }

    pub fn create_db(mut self, enabled: bool) -> Self {
        self.create_db = enabled;
        self
    }

    pub fn proxy_protocol(mut self, proxy: ProxyProtocolConfig) -> Self {
        self.proxy_protocol = Some(proxy);
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Socket address string for the TCP connect.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Client capability flags derived from this configuration.
    pub fn capability_flags(&self) -> u32 {
        let mut flags = capabilities::BASE_CLIENT_FLAGS;

        // Servers report matched rows unless the client opts into
        // affected-rows semantics
        if !self.use_affected_rows {
            flags |= capabilities::CLIENT_FOUND_ROWS;
        }

        if self.allow_multi_queries {
            flags |= capabilities::CLIENT_MULTI_STATEMENTS | capabilities::CLIENT_MULTI_RESULTS;
        }

        if self.database.is_some() {
            flags |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        if self.use_ssl {
            flags |= capabilities::CLIENT_SSL;
        }

        flags
    }
}

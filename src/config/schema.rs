//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.
//!
//! Pipeline option groups are optional tables. A group whose `id` equals its
//! reserved default id is treated as if the table were absent, except
//! `ssl_options`, which always applies.

use serde::{Deserialize, Serialize};

use crate::security::proxies::DEFAULT_PROXIES;

pub const DEFAULT_HTTP_OPTIONS_ID: &str = "defaultHttpOptions";
pub const DEFAULT_SSL_OPTIONS_ID: &str = "defaultSSLOptions";
pub const DEFAULT_REMOTE_IP_ID: &str = "defaultRemoteIp";
pub const DEFAULT_COMPRESSION_ID: &str = "defaultCompression";
pub const DEFAULT_SAMESITE_ID: &str = "defaultSameSite";
pub const DEFAULT_HEADERS_ID: &str = "defaultHeaders";
pub const DEFAULT_ACCESS_LOG_ID: &str = "defaultAccessLog";

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, TLS, HTTP/2).
    pub listener: ListenerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub http_options: Option<HttpOptions>,

    /// Always applied, whatever its id.
    pub ssl_options: SslOptions,

    pub remote_ip: Option<RemoteIpOptions>,

    pub compression: Option<CompressionOptions>,

    pub samesite: Option<SameSiteOptions>,

    pub headers: Option<HeadersOptions>,

    pub access_log: Option<AccessLogOptions>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Terminate TLS on this listener.
    pub secure: bool,

    /// Offer HTTP/2 (ALPN `h2` when secure, prior-knowledge h2c otherwise).
    pub http2_enabled: bool,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// How long shutdown waits for open connections.
    pub shutdown_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            secure: false,
            http2_enabled: true,
            max_connections: 10_000,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`.
    pub log_filter: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "conduit=info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// HTTP/1.1 protocol options.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpOptions {
    pub id: Option<String>,

    pub keep_alive_enabled: bool,

    /// Requests served per connection, 0 for unlimited.
    pub max_keep_alive_requests: u32,

    /// Largest aggregated request body in bytes, -1 for unbounded.
    pub message_size_limit: i64,

    /// Largest request head in bytes.
    pub max_head_size: usize,

    /// Bare CRLF pairs tolerated before the first request line.
    pub max_leading_crlf: usize,

    /// Bodies larger than this are written with chunked framing.
    pub chunk_size: usize,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            id: None,
            keep_alive_enabled: true,
            max_keep_alive_requests: 100,
            message_size_limit: -1,
            max_head_size: 32 * 1024,
            max_leading_crlf: 0,
            chunk_size: 8192,
        }
    }
}

/// TLS options.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct SslOptions {
    pub id: Option<String>,

    /// Path to certificate chain file (PEM).
    pub cert_path: Option<String>,

    /// Path to private key file (PEM).
    pub key_path: Option<String>,

    /// Handshake failures logged before logging is suppressed.
    pub max_handshake_log_entries: u64,
}

impl Default for SslOptions {
    fn default() -> Self {
        Self {
            id: None,
            cert_path: None,
            key_path: None,
            max_handshake_log_entries: 100,
        }
    }
}

/// Forwarded header handling.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RemoteIpOptions {
    pub id: Option<String>,

    /// Regular expression matching trusted proxy addresses.
    pub proxies: String,

    /// Report the forwarded client in access log entries.
    pub use_in_access_log: bool,
}

impl Default for RemoteIpOptions {
    fn default() -> Self {
        Self {
            id: None,
            proxies: DEFAULT_PROXIES.to_string(),
            use_in_access_log: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PreferredCoding {
    #[default]
    Gzip,
    Deflate,
}

/// Response compression.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CompressionOptions {
    pub id: Option<String>,

    pub enabled: bool,

    /// Wins ties between equally weighted codings.
    pub preferred: PreferredCoding,

    /// Content-type prefixes eligible for compression; empty means all.
    pub types: Vec<String>,

    /// Smallest body compressed, in bytes.
    pub min_size: usize,

    /// flate2 compression level, 0-9.
    pub level: u32,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            id: None,
            enabled: true,
            preferred: PreferredCoding::Gzip,
            types: vec![
                "text/".to_string(),
                "application/json".to_string(),
                "application/javascript".to_string(),
                "application/xml".to_string(),
                "image/svg+xml".to_string(),
            ],
            min_size: 0,
            level: 6,
        }
    }
}

/// `SameSite` attributes added to `Set-Cookie` headers, by cookie name.
/// `*` matches every cookie.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SameSiteOptions {
    pub id: Option<String>,
    pub lax: Vec<String>,
    pub strict: Vec<String>,
    pub none: Vec<String>,
}

/// Response header edits. Entries of `add` and `set` are `"Name: value"`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct HeadersOptions {
    pub id: Option<String>,
    pub add: Vec<String>,
    pub set: Vec<String>,
    pub remove: Vec<String>,
}

/// Access logging. Present means enabled.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AccessLogOptions {
    pub id: Option<String>,
}

/// An option group that carries a reserved default id.
pub trait OptionGroup: Clone {
    const DEFAULT_ID: &'static str;

    fn id(&self) -> Option<&str>;

    /// `None` when the group is absent or only names the default.
    fn effective(group: &Option<Self>) -> Option<Self> {
        group
            .as_ref()
            .filter(|g| g.id() != Some(Self::DEFAULT_ID))
            .cloned()
    }
}

macro_rules! option_group {
    ($ty:ty, $default:expr) => {
        impl OptionGroup for $ty {
            const DEFAULT_ID: &'static str = $default;

            fn id(&self) -> Option<&str> {
                self.id.as_deref()
            }
        }
    };
}

option_group!(HttpOptions, DEFAULT_HTTP_OPTIONS_ID);
option_group!(RemoteIpOptions, DEFAULT_REMOTE_IP_ID);
option_group!(CompressionOptions, DEFAULT_COMPRESSION_ID);
option_group!(SameSiteOptions, DEFAULT_SAMESITE_ID);
option_group!(HeadersOptions, DEFAULT_HEADERS_ID);
option_group!(AccessLogOptions, DEFAULT_ACCESS_LOG_ID);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert!(config.http_options.is_none());
        assert_eq!(config.ssl_options.max_handshake_log_entries, 100);
    }

    #[test]
    fn groups_parse_with_partial_fields() {
        let config: ServerConfig = toml::from_str(
            r#"
            [listener]
            bind_address = "127.0.0.1:9443"
            secure = true

            [ssl_options]
            cert_path = "cert.pem"
            key_path = "key.pem"

            [compression]
            preferred = "deflate"

            [remote_ip]
            id = "defaultRemoteIp"

            [headers]
            add = ["X-Served-By: conduit"]
            "#,
        )
        .unwrap();
        assert!(config.listener.secure);
        assert_eq!(config.compression.as_ref().unwrap().preferred, PreferredCoding::Deflate);
        assert!(config.compression.as_ref().unwrap().enabled);
        assert!(OptionGroup::effective(&config.remote_ip).is_none());
        assert!(OptionGroup::effective(&config.headers).is_some());
    }
}

//! Per-chain configuration snapshot.

use crate::config::schema::{
    AccessLogOptions, CompressionOptions, HeadersOptions, HttpOptions, OptionGroup, RemoteIpOptions,
    SameSiteOptions, ServerConfig, SslOptions,
};

/// Option groups in effect for chains built from one configuration.
///
/// Groups that were absent or only named their reserved default id are
/// `None`; HTTP options fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineConfig {
    pub http: HttpOptions,
    pub ssl: SslOptions,
    pub remote_ip: Option<RemoteIpOptions>,
    pub compression: Option<CompressionOptions>,
    pub samesite: Option<SameSiteOptions>,
    pub headers: Option<HeadersOptions>,
    pub access_log: Option<AccessLogOptions>,
}

impl PipelineConfig {
    pub fn from_server(config: &ServerConfig) -> Self {
        Self {
            http: OptionGroup::effective(&config.http_options).unwrap_or_default(),
            ssl: config.ssl_options.clone(),
            remote_ip: OptionGroup::effective(&config.remote_ip),
            compression: OptionGroup::effective(&config.compression),
            samesite: OptionGroup::effective(&config.samesite),
            headers: OptionGroup::effective(&config.headers),
            access_log: OptionGroup::effective(&config.access_log),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::DEFAULT_SSL_OPTIONS_ID;

    #[test]
    fn default_ids_drop_groups_except_ssl() {
        let config: ServerConfig = toml::from_str(
            r#"
            [http_options]
            id = "defaultHttpOptions"
            chunk_size = 1

            [ssl_options]
            id = "defaultSSLOptions"
            cert_path = "cert.pem"

            [access_log]

            [compression]
            id = "defaultCompression"
            "#,
        )
        .unwrap();
        let snapshot = PipelineConfig::from_server(&config);

        assert_eq!(snapshot.http, HttpOptions::default());
        assert_eq!(snapshot.ssl.id.as_deref(), Some(DEFAULT_SSL_OPTIONS_ID));
        assert_eq!(snapshot.ssl.cert_path.as_deref(), Some("cert.pem"));
        assert!(snapshot.access_log.is_some());
        assert!(snapshot.compression.is_none());
        assert!(snapshot.remote_ip.is_none());
    }
}

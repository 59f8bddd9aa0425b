//! Connection options: a plain struct validated up front, not a fluent
//! builder (the builder/option-bag surface is explicitly out of scope).
//! Shaped after the forwarder's own config loader: raw fields with
//! `Option`, a `validate` step that returns a typed error for contradictory
//! combinations.

use crate::error::HubConnectionError;
use crate::reconnect::ReconnectPolicyKind;
use crate::transport::TransportKind;
use std::collections::HashMap;
use std::sync::Arc;

/// Invoked before each connect attempt to fetch a bearer token.
pub type AccessTokenFactory = Arc<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct HubConnectionOptions {
    pub access_token_factory: Option<AccessTokenFactory>,
    pub skip_negotiation: bool,
    pub transport: Option<TransportKind>,
    pub verify_ssl: Option<bool>,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    pub headers: HashMap<String, String>,
    pub proxies: HashMap<String, String>,
    pub keep_alive_interval: std::time::Duration,
    /// Per-request timeout applied to the long-polling downstream GET only;
    /// a timed-out poll is retried rather than treated as a fatal error.
    pub poll_timeout: std::time::Duration,
    pub reconnect: Option<ReconnectPolicyKind>,
}

impl Default for HubConnectionOptions {
    fn default() -> Self {
        Self {
            access_token_factory: None,
            skip_negotiation: false,
            transport: None,
            verify_ssl: None,
            tls_config: None,
            headers: HashMap::new(),
            proxies: HashMap::new(),
            keep_alive_interval: std::time::Duration::from_secs(15),
            poll_timeout: std::time::Duration::from_secs(110),
            reconnect: None,
        }
    }
}

impl HubConnectionOptions {
    /// Reject combinations that cannot coexist. Called once by
    /// `HubConnection::new`.
    pub fn validate(&self) -> Result<(), HubConnectionError> {
        if self.skip_negotiation && self.transport != Some(TransportKind::WebSockets) {
            return Err(HubConnectionError::InvalidConfig(
                "skip_negotiation is only valid with the WebSocket transport".to_owned(),
            ));
        }
        if self.verify_ssl.is_some() && self.tls_config.is_some() {
            return Err(HubConnectionError::InvalidConfig(
                "verify_ssl and tls_config are mutually exclusive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Builds the `reqwest::Client` every HTTP-speaking transport shares,
    /// applying `verify_ssl`/`tls_config` and `proxies` — the options
    /// otherwise have no effect on the wire.
    pub fn build_http_client(&self) -> Result<reqwest::Client, HubConnectionError> {
        let mut builder = reqwest::Client::builder();

        if let Some(verify_ssl) = self.verify_ssl {
            builder = builder.danger_accept_invalid_certs(!verify_ssl);
        }
        if let Some(tls_config) = &self.tls_config {
            builder = builder.use_preconfigured_tls((**tls_config).clone());
        }

        if let Some(http_proxy) = self.proxies.get("http") {
            let proxy = reqwest::Proxy::http(http_proxy)
                .map_err(|e| HubConnectionError::InvalidConfig(format!("invalid http proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        if let Some(https_proxy) = self.proxies.get("https") {
            let proxy = reqwest::Proxy::https(https_proxy)
                .map_err(|e| HubConnectionError::InvalidConfig(format!("invalid https proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| HubConnectionError::InvalidConfig(format!("failed to build HTTP client: {e}")))
    }
}

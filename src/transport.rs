//! Pluggable HTTPS exchange.
//!
//! Kept to a narrow shape so tests can substitute a deterministic fake:
//! `exchange` for the periodic POST/response round, `ping` for the
//! pinger's cheap GET, `fetch` for arbitrary raw-byte probes.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::message::Message;

/// The request body for one exchange round.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeRequest {
    /// The exchange wire protocol version this client speaks.
    #[serde(rename = "client-api")]
    pub client_api: String,
    /// The exchange wire protocol version we expect the server to speak.
    #[serde(rename = "server-api")]
    pub server_api: String,
    /// The inbound `server_sequence + 1` we expect next.
    #[serde(rename = "next-expected-sequence")]
    pub next_expected_sequence: u64,
    /// Unix timestamp (seconds) of the previous successful exchange.
    #[serde(rename = "last-exchange-time")]
    pub last_exchange_time: f64,
    /// The currently accepted outbound types, for the server's records.
    #[serde(rename = "accepted-types")]
    pub accepted_types: Vec<String>,
    /// The packaged slice of outbound messages.
    pub messages: Vec<Message>,
}

/// The response body for one exchange round.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResponse {
    /// The outbound seq the server next expects (`client_sequence = k - 1`).
    #[serde(rename = "next-expected-sequence")]
    pub next_expected_sequence: u64,
    /// Inbound messages to dispatch, oldest-first.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Opaque identifier for the server side of this relationship.
    #[serde(rename = "server-uuid")]
    pub server_uuid: Option<String>,
    /// True if the server's accepted-types set for us changed this round.
    #[serde(rename = "client-accepted-types-changed", default)]
    pub client_accepted_types_changed: bool,
}

/// Response to a ping GET.
#[derive(Debug, Clone, Deserialize)]
pub struct PingResponse {
    /// True if the server has inbound messages waiting for us.
    pub messages: bool,
}

/// The collaborator contract for the HTTPS transport. Implementations own
/// TLS, proxying, and payload encoding; the engine only sees typed results.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one exchange round, with `secure_id` (if any) attached as `X-Computer-ID`.
    async fn exchange(
        &self,
        request: &ExchangeRequest,
        secure_id: Option<&str>,
    ) -> Result<ExchangeResponse>;

    /// Performs the pinger's liveness GET.
    async fn ping(&self, insecure_id: &str) -> Result<PingResponse>;

    /// Fetches raw bytes from an arbitrary URL, used by vm-info/container-info probes.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// `reqwest`-backed transport talking to a real server.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    exchange_url: String,
    ping_url: String,
    user_agent: String,
}

/// Proxy URLs to route the transport's HTTP(S) traffic through, if any.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Proxy for plain `http://` requests.
    pub http_proxy: Option<String>,
    /// Proxy for `https://` requests.
    pub https_proxy: Option<String>,
}

impl HttpTransport {
    /// Builds a transport bound to `exchange_url`/`ping_url`, optionally
    /// pinning the TLS trust root to a PEM-encoded `ssl_public_key` instead
    /// of the platform's default root store, and routing through `proxies`
    /// if configured.
    pub fn new(
        exchange_url: String,
        ping_url: String,
        ssl_public_key: Option<&str>,
        proxies: &ProxyConfig,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(pem) = ssl_public_key {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| BrokerError::Transport(format!("invalid ssl_public_key: {e}")))?;
            builder = builder.add_root_certificate(cert).tls_built_in_root_certs(false);
        }
        if let Some(url) = &proxies.http_proxy {
            let proxy = reqwest::Proxy::http(url)
                .map_err(|e| BrokerError::Transport(format!("invalid http_proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        if let Some(url) = &proxies.https_proxy {
            let proxy = reqwest::Proxy::https(url)
                .map_err(|e| BrokerError::Transport(format!("invalid https_proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            exchange_url,
            ping_url,
            user_agent: format!("landscape-broker/{}", env!("CARGO_PKG_VERSION")),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn exchange(
        &self,
        request: &ExchangeRequest,
        secure_id: Option<&str>,
    ) -> Result<ExchangeResponse> {
        let response = self
            .client
            .post(&self.exchange_url)
            .header("X-Computer-ID", secure_id.unwrap_or(""))
            .header("User-Agent", &self.user_agent)
            .json(request)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BrokerError::Transport(format!(
                "exchange failed: {}",
                response.status()
            )));
        }
        response
            .json::<ExchangeResponse>()
            .await
            .map_err(|e| BrokerError::Transport(format!("malformed exchange response: {e}")))
    }

    async fn ping(&self, insecure_id: &str) -> Result<PingResponse> {
        let mut params = HashMap::new();
        params.insert("insecure_id", insecure_id);
        let response = self
            .client
            .get(&self.ping_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BrokerError::Transport(format!("ping failed: {}", response.status())));
        }
        response
            .json::<PingResponse>()
            .await
            .map_err(|e| BrokerError::Transport(format!("malformed ping response: {e}")))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}

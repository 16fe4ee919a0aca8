use std::time::Duration;

use crate::error::{Kind, Result};

/// Options that shape the shared `reqwest::Client`. Kept separate from the
/// CLI `Args` struct so the client builder doesn't need to know about every
/// unrelated flag.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub proxy_url: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub insecure_skip_verify: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            // Global per-request ceiling; the engine layers a shorter,
            // size-adaptive deadline on top for image streaming.
            request_timeout: Duration::from_secs(10 * 60),
            // TLS handshake timeout.
            connect_timeout: Duration::from_secs(20),
            pool_idle_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 8,
            // The archive presents internally-signed certificates, per design.
            insecure_skip_verify: true,
        }
    }
}

/// Builds the single `reqwest::Client` shared by every subsystem for the
/// lifetime of a run, mirroring `peoci::ocidist::Client::new`'s one-client-
/// per-process shape: pooled connections, a bounded idle window, explicit
/// per-request deadline, and no HTTP/2 (the upstream archive host negotiates
/// HTTP/1.1 only, and disabling ALPN's h2 offer avoids a class of stalled
/// streams seen against flaky proxies).
pub fn build_client(config: &TransportConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .http1_only()
        .danger_accept_invalid_certs(config.insecure_skip_verify);

    if let Some(proxy_url) = &config.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| Kind::Config(format!("invalid proxy url {proxy_url}: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| Kind::Config(format!("building http client: {e}")))
}

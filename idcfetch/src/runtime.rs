use std::sync::Arc;

use crate::cache::MetadataCache;
use crate::config::Config;
use crate::error::{Kind, Result};
use crate::stats::DownloadStats;
use crate::token::TokenManager;
use crate::transport::{build_client, TransportConfig};

/// Bundles everything a worker task needs, constructed once in `main` and
/// cloned/shared into every spawned task. Replaces the "global mutable
/// state (shared client, token, logger)" the design calls out, with no
/// `static`/`once_cell` anywhere in this crate.
pub struct Runtime {
    pub client: reqwest::Client,
    pub token_manager: Arc<TokenManager>,
    pub metadata_cache: Arc<MetadataCache>,
    pub stats: Arc<DownloadStats>,
    pub config: Config,
}

impl Runtime {
    pub async fn build(config: Config, total_series: u64) -> Result<Self> {
        tokio::fs::create_dir_all(&config.output)
            .await
            .map_err(Kind::from)?;

        let transport_config = TransportConfig {
            proxy_url: config.proxy.clone(),
            pool_max_idle_per_host: config.max_conns_per_host * 2,
            insecure_skip_verify: config.insecure_skip_verify,
            ..Default::default()
        };
        let client = build_client(&transport_config)?;

        let credential_path = config.output.join(format!("{}.json", config.credential_name));
        let token_manager = Arc::new(TokenManager::new(
            client.clone(),
            config.token_url.clone(),
            config.username.clone(),
            config.password.clone(),
            config.client_id.clone(),
            Some(credential_path),
        ));
        token_manager.load_persisted().await;

        let metadata_cache = Arc::new(MetadataCache::open(&config.output).await?);
        let stats = Arc::new(DownloadStats::new(total_series));

        Ok(Self {
            client,
            token_manager,
            metadata_cache,
            stats,
            config,
        })
    }
}

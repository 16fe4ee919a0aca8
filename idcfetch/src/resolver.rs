use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::MetadataCache;
use crate::error::Kind;
use crate::model::MetadataResponse;
use crate::request;
use crate::stats::DownloadStats;
use crate::token::TokenManager;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Base the metadata endpoint is rooted at, before the API version
    /// segment is inserted.
    pub metadata_base: String,
    pub api_version: String,
    pub api_version_fallback: String,
    pub metadata_workers: usize,
    pub force_refresh: bool,
}

const METADATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves metadata for every UID in `uids`, bounded to `config.metadata_workers`
/// concurrent requests. One task is spawned per UID, gated by a semaphore,
/// the async equivalent of a fixed worker pool draining a queue, following
/// `pegh::Client::get_gist_impl`'s semaphore-gated fan-out and
/// `peoci::ocidist_cache::get_layers`'s `JoinSet` dispatch.
///
/// Output ordering is not guaranteed; the cache (last-writer-wins on an
/// atomic rename) is the dedup authority, not this function.
pub async fn resolve_all(
    client: reqwest::Client,
    token_manager: Arc<TokenManager>,
    cache: Arc<MetadataCache>,
    stats: Arc<DownloadStats>,
    config: ResolverConfig,
    uids: Vec<String>,
) {
    let semaphore = Arc::new(Semaphore::new(config.metadata_workers.max(1)));
    let config = Arc::new(config);
    let mut tasks = JoinSet::new();

    for uid in uids {
        let permit = semaphore.clone();
        let client = client.clone();
        let token_manager = token_manager.clone();
        let cache = cache.clone();
        let stats = stats.clone();
        let config = config.clone();

        tasks.spawn(async move {
            let _permit = permit
                .acquire_owned()
                .await
                .expect("metadata semaphore closed unexpectedly");
            resolve_one(&client, &token_manager, &cache, &stats, &config, &uid).await;
        });
    }

    while tasks.join_next().await.is_some() {
        stats.maybe_print_progress(false);
    }
}

async fn resolve_one(
    client: &reqwest::Client,
    token_manager: &TokenManager,
    cache: &MetadataCache,
    stats: &DownloadStats,
    config: &ResolverConfig,
    uid: &str,
) {
    if !config.force_refresh && cache.contains(uid).await {
        stats.inc_cached();
        return;
    }

    match fetch_and_store(client, token_manager, cache, config, uid).await {
        Ok(()) => stats.inc_fetched(),
        Err(e) => {
            log::warn!("metadata fetch failed for {uid}: {e}");
            stats.inc_failed();
        }
    }
}

async fn fetch_and_store(
    client: &reqwest::Client,
    token_manager: &TokenManager,
    cache: &MetadataCache,
    config: &ResolverConfig,
    uid: &str,
) -> crate::error::Result<()> {
    let bearer = token_manager.access_token().await?;

    let response = tokio::time::timeout(
        METADATA_REQUEST_TIMEOUT,
        request::get_with_version_fallback(
            client,
            &config.metadata_base,
            &config.api_version,
            &config.api_version_fallback,
            "metadata",
            &[("SeriesInstanceUID", uid)],
            &bearer,
        ),
    )
    .await
    .map_err(|_| Kind::Transport("metadata request timed out".to_string()))??;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(Kind::Auth(format!("metadata endpoint returned {status}")));
    }
    if !status.is_success() {
        return Err(Kind::Server(status));
    }

    let body: MetadataResponse = response.json().await.map_err(Kind::from)?;
    for record in body.into_records() {
        if record.is_valid() {
            cache.put(&record).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SeriesRecord;
    use httpmock::prelude::*;

    fn sample_record_body(uid: &str) -> String {
        serde_json::json!({
            "SeriesInstanceUID": uid,
            "StudyInstanceUID": "study-1",
            "PatientID": "subject-1",
            "Collection": "TCGA-X",
        })
        .to_string()
    }

    fn token_manager(client: reqwest::Client, server: &MockServer) -> Arc<TokenManager> {
        Arc::new(TokenManager::new(
            client,
            format!("{}/token", server.base_url()),
            "user".to_string(),
            "pass".to_string(),
            "id".to_string(),
            None,
        ))
    }

    fn config_for(server: &MockServer) -> ResolverConfig {
        ResolverConfig {
            metadata_base: server.base_url(),
            api_version: "v2".to_string(),
            api_version_fallback: "v1".to_string(),
            metadata_workers: 4,
            force_refresh: false,
        }
    }

    #[tokio::test]
    async fn cached_series_increments_cached_not_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MetadataCache::open(dir.path()).await.unwrap());
        let record = SeriesRecord {
            series_uid: "1.2.3".to_string(),
            study_uid: "s".to_string(),
            subject_id: "p".to_string(),
            study_date: String::new(),
            collection: String::new(),
            file_size_uncompressed: None,
            modality: String::new(),
            series_description: String::new(),
            series_number: None,
            number_of_images: None,
            extra: serde_json::Map::new(),
        };
        cache.put(&record).await.unwrap();

        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/v2/metadata");
            then.status(500);
        });

        let client = reqwest::Client::new();
        let token_manager = token_manager(client.clone(), &server);
        let stats = Arc::new(DownloadStats::new(1));
        let config = config_for(&server);

        resolve_all(
            client,
            token_manager,
            cache.clone(),
            stats.clone(),
            config,
            vec!["1.2.3".to_string()],
        )
        .await;

        assert_eq!(stats.cached.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(stats.fetched.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn fetches_and_caches_uncached_series() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MetadataCache::open(dir.path()).await.unwrap());

        let server = MockServer::start();
        let token_mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200).json_body(serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600,
            }));
        });
        let metadata_mock = server.mock(|when, then| {
            when.method(GET).path("/v2/metadata").query_param("SeriesInstanceUID", "1.2.3");
            then.status(200)
                .header("content-type", "application/json")
                .body(sample_record_body("1.2.3"));
        });

        let client = reqwest::Client::new();
        let token_manager = token_manager(client.clone(), &server);
        let stats = Arc::new(DownloadStats::new(1));
        let config = config_for(&server);

        resolve_all(
            client,
            token_manager,
            cache.clone(),
            stats.clone(),
            config,
            vec!["1.2.3".to_string()],
        )
        .await;

        assert_eq!(stats.fetched.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(cache.contains("1.2.3").await);
        token_mock.assert();
        metadata_mock.assert();
    }

    #[tokio::test]
    async fn auth_failure_is_recorded_as_failed_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MetadataCache::open(dir.path()).await.unwrap());

        let server = MockServer::start();
        let _token_mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200).json_body(serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600,
            }));
        });
        let _metadata_mock = server.mock(|when, then| {
            when.method(GET).path("/v2/metadata");
            then.status(403);
        });

        let client = reqwest::Client::new();
        let token_manager = token_manager(client.clone(), &server);
        let stats = Arc::new(DownloadStats::new(1));
        let config = config_for(&server);

        resolve_all(
            client,
            token_manager,
            cache.clone(),
            stats.clone(),
            config,
            vec!["1.2.3".to_string()],
        )
        .await;

        assert_eq!(stats.failed.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(!cache.contains("1.2.3").await);
    }

    /// The metadata request falls back from the newer API version segment to
    /// the older one on a 5xx, per the request layer's sole fallback rule.
    #[tokio::test]
    async fn falls_back_to_older_api_version_on_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MetadataCache::open(dir.path()).await.unwrap());

        let server = MockServer::start();
        let _token_mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200).json_body(serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600,
            }));
        });
        let newer_mock = server.mock(|when, then| {
            when.method(GET).path("/v2/metadata");
            then.status(502);
        });
        let older_mock = server.mock(|when, then| {
            when.method(GET).path("/v1/metadata").query_param("SeriesInstanceUID", "1.2.3");
            then.status(200)
                .header("content-type", "application/json")
                .body(sample_record_body("1.2.3"));
        });

        let client = reqwest::Client::new();
        let token_manager = token_manager(client.clone(), &server);
        let stats = Arc::new(DownloadStats::new(1));
        let config = config_for(&server);

        resolve_all(
            client,
            token_manager,
            cache.clone(),
            stats.clone(),
            config,
            vec!["1.2.3".to_string()],
        )
        .await;

        assert_eq!(stats.fetched.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(cache.contains("1.2.3").await);
        newer_mock.assert();
        older_mock.assert();
    }
}

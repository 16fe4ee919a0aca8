pub mod archive;
pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod manifest;
pub mod model;
pub mod request;
pub mod resolver;
pub mod runtime;
pub mod stats;
pub mod token;
pub mod transport;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use config::Config;
use download::DownloadOptions;
use error::Result;
use runtime::Runtime;

/// Runs one full pass: parse the manifest, resolve metadata, download every
/// series that needs it, print a summary. Returns the process exit code per
/// the resolved Open Question (0 on any completed run, regardless of
/// per-series failures).
pub async fn run(config: Config) -> Result<i32> {
    let manifest_contents = tokio::fs::read_to_string(&config.input)
        .await
        .map_err(|e| error::Kind::Config(format!("reading manifest {}: {e}", config.input.display())))?;
    let uids = manifest::parse(&manifest_contents);

    let runtime = Runtime::build(config, uids.len() as u64).await?;

    let started = Instant::now();

    let resolver_config = resolver::ResolverConfig {
        metadata_base: runtime.config.metadata_base.clone(),
        api_version: runtime.config.api_version.clone(),
        api_version_fallback: runtime.config.api_version_fallback.clone(),
        metadata_workers: runtime.config.metadata_workers,
        force_refresh: runtime.config.refresh_metadata,
    };

    tokio::select! {
        _ = resolver::resolve_all(
            runtime.client.clone(),
            runtime.token_manager.clone(),
            runtime.metadata_cache.clone(),
            runtime.stats.clone(),
            resolver_config,
            uids.clone(),
        ) => {}
        _ = tokio::signal::ctrl_c() => {
            log::warn!("interrupted during metadata resolution, stopping before any download starts");
            runtime.stats.maybe_print_progress(true);
            runtime.token_manager.close().await;
            return Ok(0);
        }
    }
    runtime.stats.maybe_print_progress(true);

    if runtime.config.meta_only {
        print_summary(&runtime, started);
        runtime.token_manager.close().await;
        return Ok(runtime.stats.exit_code());
    }

    download_all(&runtime, &uids).await;

    print_summary(&runtime, started);
    runtime.token_manager.close().await;
    Ok(runtime.stats.exit_code())
}

async fn download_all(runtime: &Runtime, uids: &[String]) {
    let semaphore = Arc::new(Semaphore::new(runtime.config.concurrency.max(1)));
    let mut tasks = JoinSet::new();

    let options = Arc::new(DownloadOptions {
        layout: runtime.config.layout,
        hash_verify: runtime.config.hash_verify,
        force: runtime.config.force,
        skip_existing: runtime.config.skip_existing,
        max_retries: runtime.config.max_retries,
        retry_delay: runtime.config.retry_delay,
        request_delay: runtime.config.request_delay,
        image_base: runtime.config.image_base.clone(),
        api_version: runtime.config.api_version.clone(),
        api_version_fallback: runtime.config.api_version_fallback.clone(),
    });

    for uid in uids.iter().cloned() {
        let Some(record) = runtime.metadata_cache.get(&uid).await else {
            // Metadata resolution already recorded this as failed; nothing to
            // download for a series with no record.
            continue;
        };

        let permit = semaphore.clone();
        let client = runtime.client.clone();
        let token_manager = runtime.token_manager.clone();
        let stats = runtime.stats.clone();
        let options = options.clone();
        let output = runtime.config.output.clone();

        tasks.spawn(async move {
            let _permit = permit
                .acquire_owned()
                .await
                .expect("download semaphore closed unexpectedly");

            let bearer = match token_manager.access_token().await {
                Ok(token) => token,
                Err(e) => {
                    log::warn!("series {}: could not obtain bearer token: {e}", record.series_uid);
                    stats.inc_failed();
                    return;
                }
            };

            match download::download_one_series(&client, &bearer, &output, &record, &options).await {
                Ok(download::Outcome::Downloaded) => stats.inc_downloaded(),
                Ok(download::Outcome::Skipped) => stats.inc_skipped(),
                Err(e) => {
                    log::warn!("series {} failed: {e}", record.series_uid);
                    stats.inc_failed();
                }
            }
            stats.maybe_print_progress(false);
        });
    }

    loop {
        tokio::select! {
            next = tasks.join_next() => {
                if next.is_none() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::warn!("interrupted, waiting for in-flight series to reach a safe state");
                tasks.shutdown().await;
                break;
            }
        }
    }
}

fn print_summary(runtime: &Runtime, started: Instant) {
    runtime.stats.maybe_print_progress(true);
    let elapsed = started.elapsed();
    let downloaded = runtime
        .stats
        .downloaded
        .load(std::sync::atomic::Ordering::Relaxed);
    let rate = if elapsed.as_secs_f64() > 0.0 {
        downloaded as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    println!(
        "{}\nElapsed: {:.1}s, avg {:.2} series/sec",
        runtime.stats.summary(),
        elapsed.as_secs_f64(),
        rate
    );
}

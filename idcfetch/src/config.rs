use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::download::LayoutMode;
use crate::error::{Kind, Result};

/// Command-line surface, matching the configuration table in the design:
/// every recognized option is a flag here, with `server_friendly` applied as
/// a post-parse preset override rather than a separate config file, since this
/// crate, like the rest of the workspace, takes configuration from flags and
/// env vars only.
#[derive(Debug, Parser)]
#[command(name = "idcfetch", about = "Batch fetcher for a medical-imaging archive")]
pub struct Args {
    /// Path to the input manifest.
    #[arg(long)]
    pub input: PathBuf,

    /// Output root directory.
    #[arg(long)]
    pub output: PathBuf,

    /// Download worker pool size.
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,

    /// Metadata resolver worker pool size.
    #[arg(long, default_value_t = 20)]
    pub metadata_workers: usize,

    /// Max idle connections kept per host in the HTTP pool.
    #[arg(long, default_value_t = 8)]
    pub max_conns_per_host: usize,

    /// Max retry attempts per series after the initial try.
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Initial retry backoff, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// Minimum delay before each attempt, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub request_delay_ms: u64,

    /// Bypass the `NeedsDownload` precondition and re-download everything.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Skip a series when the precondition reports "present and correct".
    #[arg(long, default_value_t = true)]
    pub skip_existing: bool,

    /// Enable per-file hash validation during extraction.
    #[arg(long, default_value_t = false)]
    pub hash_verify: bool,

    /// Keep downloaded archives as `.zip` instead of extracting them.
    #[arg(long, default_value_t = false)]
    pub no_extract: bool,

    /// Bypass the metadata cache and always fetch fresh records.
    #[arg(long, default_value_t = false)]
    pub refresh_metadata: bool,

    /// Apply the conservative preset: 1 download worker, 2 connections per
    /// host, 30s initial backoff, 2s request delay, 5 metadata workers.
    #[arg(long, default_value_t = false)]
    pub server_friendly: bool,

    /// Upstream HTTP or SOCKS5 proxy URL.
    #[arg(long)]
    pub proxy: Option<String>,

    /// Stop after metadata resolution; do not download any series.
    #[arg(long, default_value_t = false)]
    pub meta_only: bool,

    #[arg(long, default_value = "https://archive.example.test/api")]
    pub base_url: String,

    #[arg(long)]
    pub token_url: Option<String>,

    /// Base the metadata endpoint is rooted at, before the API version
    /// segment. Defaults to `base_url`.
    #[arg(long)]
    pub meta_url: Option<String>,

    /// Base the image endpoint is rooted at, before the API version segment.
    /// Defaults to `base_url`.
    #[arg(long)]
    pub image_url: Option<String>,

    #[arg(long, default_value = "v2")]
    pub api_version: String,

    #[arg(long, default_value = "v1")]
    pub api_version_fallback: String,

    #[arg(long)]
    pub username: String,

    #[arg(long)]
    pub password: String,

    #[arg(long)]
    pub client_id: String,

    #[arg(long, default_value = "credentials")]
    pub credential_name: String,

    /// Defaults to true: the archive is known to present internally-signed
    /// certificates, so verification is relaxed unless the operator points
    /// this at a host with a publicly trusted chain.
    #[arg(long, default_value_t = true)]
    pub insecure_skip_verify: bool,
}

/// Fully resolved configuration after preset application and cross-flag
/// validation. The orchestrator only ever looks at this, never at `Args`
/// directly.
#[derive(Debug, Clone)]
pub struct Config {
    pub input: PathBuf,
    pub output: PathBuf,
    pub concurrency: usize,
    pub metadata_workers: usize,
    pub max_conns_per_host: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_delay: Duration,
    pub force: bool,
    pub skip_existing: bool,
    pub hash_verify: bool,
    pub layout: LayoutMode,
    pub refresh_metadata: bool,
    pub proxy: Option<String>,
    pub meta_only: bool,
    pub token_url: String,
    /// Base the metadata endpoint is rooted at; the request layer inserts
    /// `api_version` (falling back to `api_version_fallback`) and the
    /// `metadata` path segment on top of this.
    pub metadata_base: String,
    /// Base the image endpoint is rooted at; same versioning scheme as
    /// `metadata_base`.
    pub image_base: String,
    pub api_version: String,
    pub api_version_fallback: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub credential_name: String,
    pub insecure_skip_verify: bool,
}

impl Config {
    /// Applies the `server_friendly` preset (if requested) and validates the
    /// combination of flags, matching scenario F: `no_extract && hash_verify`
    /// is a fatal `Config` error raised before any network I/O.
    pub fn from_args(mut args: Args) -> Result<Self> {
        if args.server_friendly {
            args.concurrency = 1;
            args.max_conns_per_host = 2;
            args.retry_delay_ms = 30_000;
            args.request_delay_ms = 2_000;
            args.metadata_workers = 5;
        }

        if args.no_extract && args.hash_verify {
            return Err(Kind::Config(
                "hash_verify requires extraction; incompatible with no_extract".to_string(),
            ));
        }

        if args.concurrency == 0 {
            return Err(Kind::Config("concurrency must be at least 1".to_string()));
        }
        if args.metadata_workers == 0 {
            return Err(Kind::Config("metadata_workers must be at least 1".to_string()));
        }

        let layout = if args.no_extract {
            LayoutMode::KeepZip
        } else {
            LayoutMode::Extract
        };

        let token_url = args
            .token_url
            .unwrap_or_else(|| format!("{}/token", args.base_url.trim_end_matches('/')));
        let metadata_base = args.meta_url.unwrap_or_else(|| args.base_url.clone());
        let image_base = args.image_url.unwrap_or(args.base_url);

        Ok(Config {
            input: args.input,
            output: args.output,
            concurrency: args.concurrency,
            metadata_workers: args.metadata_workers,
            max_conns_per_host: args.max_conns_per_host,
            max_retries: args.max_retries,
            retry_delay: Duration::from_millis(args.retry_delay_ms),
            request_delay: Duration::from_millis(args.request_delay_ms),
            force: args.force,
            skip_existing: args.skip_existing,
            hash_verify: args.hash_verify,
            layout,
            refresh_metadata: args.refresh_metadata,
            proxy: args.proxy,
            meta_only: args.meta_only,
            token_url,
            metadata_base,
            image_base,
            api_version: args.api_version,
            api_version_fallback: args.api_version_fallback,
            username: args.username,
            password: args.password,
            client_id: args.client_id,
            credential_name: args.credential_name,
            insecure_skip_verify: args.insecure_skip_verify,
        })
    }
}

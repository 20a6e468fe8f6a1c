use crate::health::{monitor_pool, HealthLevel, PoolHealthChecker};
use crate::metrics::PrometheusExporter;
use crate::progress::LogSink;
use crate::service::LookupService;
use crate::types::{AddressBatch, AddressQuery};
use crate::{validator, Config};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "aml-lookup")]
#[command(about = "Risk lookups for crypto addresses")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Browser pool capacity")]
    pub pool_size: Option<usize>,

    #[arg(long, global = true, help = "Per-attempt fetch timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Look up the risk profile of one address
    Lookup {
        address: String,

        #[arg(short, long, help = "Network token (ETH, BSC, MATIC, BTC, TRX, ...)")]
        network: Option<String>,
    },

    /// Look up every address in a file (`address[,network]` per line)
    Batch {
        file: PathBuf,

        #[arg(long, help = "Addresses looked up concurrently per chunk")]
        chunk_size: Option<usize>,
    },

    /// Check address syntax without any lookup
    Validate { address: String },

    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Launch a browser session and report pool health
    Health,

    /// Remove cached results: one address, this namespace, or everything
    CacheClear {
        #[arg(long, help = "Only remove this address")]
        address: Option<String>,

        #[arg(short, long, requires = "address", help = "Network of --address")]
        network: Option<String>,

        #[arg(long, conflicts_with = "address", help = "Clear the whole store, not just this namespace")]
        all: bool,
    },
}

/// Loads `--config` (or defaults), then `AML_*` environment overrides, then
/// command line flags.
pub fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;

    if let Some(pool_size) = args.pool_size {
        config.pool.capacity = pool_size;
    }
    if let Some(timeout) = args.timeout {
        config.fetch.attempt_timeout = Duration::from_secs(timeout);
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
    if let Commands::Batch {
        chunk_size: Some(chunk_size),
        ..
    } = &args.command
    {
        config.batch.chunk_size = *chunk_size;
    }

    config.validate()?;
    Ok(config)
}

pub struct CliRunner {
    pub config: Config,
    metrics_port: Option<u16>,
}

impl CliRunner {
    pub fn new(config: Config, args: &Cli) -> Self {
        Self {
            config,
            metrics_port: args.metrics_port,
        }
    }

    /// Runs `command`. Commands that start the lookup service stop early
    /// when `cancel` fires and always shut the service down.
    pub async fn run(&self, command: Commands, cancel: CancellationToken) -> anyhow::Result<()> {
        match command {
            Commands::Validate { address } => self.validate_address(&address),
            Commands::CheckConfig => self.check_config(),
            Commands::Lookup { address, network } => {
                let service = self.start_service()?;
                let result = tokio::select! {
                    result = self.run_lookup(&service, AddressQuery::with_token(address, network.as_deref())) => result,
                    _ = cancel.cancelled() => {
                        warn!("Lookup interrupted");
                        Ok(())
                    }
                };
                service.shutdown().await;
                result
            }
            Commands::Batch { file, .. } => {
                let service = self.start_service()?;
                let result = self.run_batch(&service, &file, cancel).await;
                service.shutdown().await;
                result
            }
            Commands::Health => {
                let service = self.start_service()?;
                let result = self.show_health(&service).await;
                service.shutdown().await;
                result
            }
            Commands::CacheClear { address, network, all } => {
                let service = self.start_service()?;
                let result = self.clear_cache(&service, address, network, all).await;
                service.shutdown().await;
                result
            }
        }
    }

    fn start_service(&self) -> anyhow::Result<LookupService> {
        if let Some(port) = self.metrics_port {
            PrometheusExporter::new(port).install()?;
        }
        Ok(LookupService::new(self.config.clone())?)
    }

    async fn run_lookup(&self, service: &LookupService, query: AddressQuery) -> anyhow::Result<()> {
        info!("Looking up {} on {}", query.address, query.network);

        match service.lookup_single(&query, Arc::new(LogSink)).await {
            Ok(result) => {
                print_json(&result)?;
                Ok(())
            }
            Err(e) => {
                print_json(&serde_json::json!({ "error": e.to_body() }))?;
                Err(e.into())
            }
        }
    }

    async fn run_batch(&self, service: &LookupService, file: &Path, cancel: CancellationToken) -> anyhow::Result<()> {
        let content = fs::read_to_string(file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;
        let batch = AddressBatch::from_lines(&content);
        if batch.is_empty() {
            warn!("No addresses found in {}", file.display());
            return Ok(());
        }
        info!("Loaded {} addresses from {}", batch.len(), file.display());

        let monitor_cancel = cancel.child_token();
        let monitor = monitor_pool(
            || service.pool_stats(),
            PoolHealthChecker::default(),
            service.metrics().clone(),
            HEALTH_INTERVAL,
            monitor_cancel.clone(),
        );
        let lookups = async {
            let task = service.lookup_batch(batch, Arc::new(LogSink), cancel).await;
            monitor_cancel.cancel();
            task
        };
        let (task, ()) = tokio::join!(lookups, monitor);
        print_json(&task)?;
        info!(
            "Batch {} {:?}: {} succeeded, {} failed",
            task.id,
            task.status,
            task.success_count(),
            task.error_count()
        );
        Ok(())
    }

    fn validate_address(&self, address: &str) -> anyhow::Result<()> {
        let result = validator::validate(address);
        print_json(&result)?;
        if !result.valid {
            if let Some(e) = result.to_error(address) {
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn check_config(&self) -> anyhow::Result<()> {
        println!("Configuration is valid:");
        println!("  Session URL: {}", self.config.target.url_template);
        println!("  HTTP URL: {}", self.config.target.http_url_template);
        println!("  Pool capacity: {}", self.config.pool.capacity);
        println!("  Strategies: {:?}", self.config.fetch.strategies);
        println!(
            "  Timeouts: attempt {:?}, overall {:?}",
            self.config.fetch.attempt_timeout, self.config.fetch.overall_timeout
        );
        println!("  Max retries: {}", self.config.fetch.max_retries);
        println!("  Chunk size: {}", self.config.batch.chunk_size);
        println!("  Proxies: {}", self.config.http.proxies.len());
        println!(
            "  Cache: {} (ttl {:?})",
            if self.config.cache.enabled { "enabled" } else { "disabled" },
            self.config.cache.ttl
        );
        Ok(())
    }

    async fn show_health(&self, service: &LookupService) -> anyhow::Result<()> {
        let launched = service.warm_up().await;
        let status = PoolHealthChecker::default().check(&service.pool_stats());
        print_json(&status)?;
        if status.overall == HealthLevel::Critical {
            error!("Browser pool is unhealthy");
        }
        launched.context("browser session could not be started")
    }

    async fn clear_cache(
        &self,
        service: &LookupService,
        address: Option<String>,
        network: Option<String>,
        all: bool,
    ) -> anyhow::Result<()> {
        let cache = service.cache();
        let summary = match address {
            Some(address) => {
                let query = AddressQuery::with_token(address, network.as_deref());
                let removed = cache.invalidate(&query).await?;
                info!("Cache entry for {} on {} removed: {}", query.address, query.network, removed);
                serde_json::json!({ "address": query.address, "network": query.network, "removed": removed })
            }
            None if all => {
                cache.flush_all().await?;
                warn!("Cleared the entire cache store");
                serde_json::json!({ "flushed": "all" })
            }
            None => {
                let removed = cache.flush().await?;
                info!("Removed {} cached entries under namespace {}", removed, self.config.cache.namespace);
                serde_json::json!({ "namespace": self.config.cache.namespace, "removed": removed })
            }
        };
        print_json(&summary)
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))?;

    Ok(())
}

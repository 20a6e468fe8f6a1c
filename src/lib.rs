//! # AML Lookup
//!
//! Risk lookups for crypto addresses against a JavaScript-heavy, bot-defended
//! web upstream. A lookup validates the address, checks a TTL cache, fetches
//! the rendered result page through an ordered chain of fetch strategies
//! (pooled headless-browser sessions, a direct HTTP client, a proxy-rotated
//! HTTP client) and extracts a normalized risk profile from it.
//!
//! ## Features
//!
//! - **Address validation**: ETH/BSC/MATIC (EIP-55), BTC, TRX, SOL, LTC, DOGE
//!   and XRP syntax checks, with no resource spent on invalid input
//! - **Browser session pool**: bounded pool of fingerprinted Chrome sessions
//!   with overflow sessions, recycling and unhealthy-session eviction
//! - **Fallback chain**: challenge-aware retries across strategies with
//!   exponential backoff and a hard per-lookup deadline
//! - **Declarative extraction**: selector, script-state, text-anchor and
//!   table rules that degrade field by field instead of failing
//! - **Batches**: chunked concurrent lookups with monotonic progress events
//!   and cooperative cancellation
//! - **Metrics**: `metrics` counters and histograms with an optional
//!   Prometheus exporter
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aml_lookup::{AddressQuery, Config, LookupService, Network, NoopSink};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = LookupService::new(Config::default())?;
//!
//!     let query = AddressQuery::new("0x742d35Cc6634C0532925a3b844Bc454e4438f44e", Network::Eth);
//!     let result = service.lookup_single(&query, Arc::new(NoopSink)).await?;
//!     println!("{}: {}", result.address, result.risk_level_or_unknown());
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! aml-lookup lookup 0x742d35Cc6634C0532925a3b844Bc454e4438f44e --network ETH
//! aml-lookup batch addresses.txt --chunk-size 5
//! aml-lookup validate TN3W4H6rK2ce4vX9YnFQHwKENnHjoxb3m9
//! ```

/// Shared data model: queries, results, batch tasks
pub mod types;

/// Address syntax validation and checksum normalization
pub mod validator;

/// Configuration and settings
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// TTL cache over a pluggable key-value store
pub mod cache;

/// Browser driver abstraction and the Chromium implementation
pub mod session;

/// Desktop browser fingerprints for automated sessions
pub mod fingerprint;

/// Bounded pool of automated browser sessions
pub mod browser_pool;

/// Fetch strategies that produce a rendered result page
pub mod fetch;

/// Declarative extraction of risk data from rendered pages
pub mod extractor;

/// Progress events, sinks and completion tracking
pub mod progress;

/// Single-address lookup pipeline
pub mod orchestrator;

/// Chunked batch execution
pub mod batch;

/// Process-level service wiring
pub mod service;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and monitoring
pub mod metrics;

/// Health evaluation for the browser session pool
pub mod health;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod testing;


pub use batch::*;
pub use browser_pool::*;
pub use cache::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use extractor::*;
pub use fetch::{FetchStrategy, FetchTarget, HttpFetch, ProxyFetch, RenderedPage, SessionFetch, StrategyKind};
pub use fingerprint::*;
pub use health::*;
pub use metrics::*;
pub use orchestrator::*;
pub use progress::*;
pub use service::*;
pub use session::*;
pub use types::*;
pub use utils::*;
pub use validator::{normalize, validate, ValidationReason, ValidationResult};

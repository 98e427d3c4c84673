//! Showtime Fetch - proxy-rotating listing fetcher
//!
//! Retrieves per-location show listings from a remote JSON API for many
//! locations at once. Requests are routed through a pool of validated proxies
//! that a background refresher keeps populated; failing proxies are evicted
//! and attempts retried with exponential backoff.

pub mod config;
pub mod error;
pub mod fetch;
pub mod orchestrator;
pub mod proxy;
pub mod refresher;
pub mod sink;
pub mod task;

pub use config::Config;
pub use error::{FetchError, RunError, TaskLoadError, TransportError};
pub use fetch::{FetchOutcome, FetchWorker, HttpListingFetcher, ListingFetcher, RetryPolicy};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunStatistics};
pub use proxy::{ProxyEndpoint, ProxyPool, ProxyScheme, ProxySource, ProxyValidator};
pub use refresher::{ProxyRefresher, RefreshReport};
pub use sink::{FileSink, PersistenceSink};
pub use task::LocationTask;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

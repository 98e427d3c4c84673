//! Fetching listings through rotating proxies
//!
//! This module provides:
//! - The retry/backoff policy applied to every task
//! - The listing fetcher collaborator and its reqwest implementation
//! - The fetch worker that drives attempts against the shared pool

pub mod client;
pub mod retry;
pub mod worker;

pub use client::{FetchResponse, HttpListingFetcher, ListingFetcher, RequestTemplate};
pub use retry::RetryPolicy;
pub use worker::{FetchOutcome, FetchWorker};

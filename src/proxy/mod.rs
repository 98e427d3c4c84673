//! Proxy handling
//!
//! This module provides:
//! - The proxy endpoint model and list parsing
//! - External sources of candidate proxies
//! - Validation of candidates against a probe URL
//! - The shared pool fetch workers draw proxies from

pub mod models;
pub mod parser;
pub mod pool;
pub mod source;
pub mod validator;

pub use models::{ProxyAuth, ProxyEndpoint, ProxyScheme};
pub use parser::ProxyParser;
pub use pool::ProxyPool;
pub use source::{FileSource, GatherResult, HttpSource, ProxySource, SourceFormat};
pub use validator::{ProxyValidator, ValidatorConfig};

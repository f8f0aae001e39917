//! Transcache - a layered translation cache
//!
//! A TTL-aware memory tier in front of a sorted, file-persisted key-value
//! store, composed by a coordinator with sync or write-behind propagation.

pub mod cache;
pub mod config;
pub mod error;
pub mod store;
pub mod tasks;

pub use cache::{BufferedCache, BufferedConfig, CacheFacade, CacheStats, MemoryCache};
pub use config::Config;
pub use error::{CacheError, Result};
pub use store::{FileStore, StorePaths};

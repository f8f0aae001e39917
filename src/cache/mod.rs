//! Cache Module
//!
//! The memory tier, the [`CacheFacade`] interface shared by every tier, and
//! the coordinator that layers memory over the persistent store.

mod buffered;
mod entry;
mod facade;
mod memory;
mod pattern;
mod stats;


// Re-export public types
pub use buffered::{BufferedCache, BufferedConfig};
pub use facade::{CacheFacade, NullCache};
pub use memory::{MemoryCache, DEFAULT_SWEEP_INTERVAL};
pub use pattern::matches_pattern;
pub use stats::CacheStats;

pub(crate) use stats::StatsRecorder;

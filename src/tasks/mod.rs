//! Background Tasks Module
//!
//! Contains the tasks that run alongside the cache.
//!
//! # Tasks
//! - TTL Sweeper: removes expired memory-tier entries at a fixed interval
//! - Write-Behind: applies queued persistent-tier writes in async mode

mod sweeper;
mod write_behind;

pub use sweeper::spawn_sweeper_task;
pub use write_behind::{WriteBehind, WriteJob};

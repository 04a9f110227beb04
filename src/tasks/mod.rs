//! Background Tasks Module
//!
//! Periodic work that runs alongside the sync engines.
//!
//! # Tasks
//! - Cache maintenance: TTL cleanup followed by an LRU trim

mod cleanup;

pub use cleanup::spawn_cleanup_task;

//! Job scheduler runner.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructor, submission and accessor methods
//! - `sweep`: the periodic sweep, stall recovery and the main loop
//! - `backfill`: history re-scoring over explicit step boundaries

mod backfill;
mod core;
mod sweep;

pub use self::core::Scheduler;

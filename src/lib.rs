// Harvest Sync Library
// Offline-first harvest report submission; main.rs and host apps use these modules

pub mod cache;
pub mod config;
pub mod confirmation;
pub mod connectivity;
pub mod db;
pub mod dmf;
pub mod error;
pub mod identity;
pub mod migration;
pub mod model;
pub mod rewards;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use error::{Result, SyncError};
pub use sync::{CycleReport, SyncEngine, Trigger};

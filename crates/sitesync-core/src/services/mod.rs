//! Services exposed to applications embedding the sync engine.

mod scheduler;
mod sync_service;

pub use sync_service::{EngineStatus, SyncService};

#[cfg(test)]
mod tests;

//! Multi-destination backups and disaster recovery for the application database
//! and its uploaded files.

pub mod archive;
pub mod audit;
pub mod config;
pub mod errors;
pub mod logging;
pub mod maintenance;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod reaper;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod storage;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

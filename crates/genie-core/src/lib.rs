//! Core state for Genie: the versioned task/session stores, status
//! reconciliation, configuration and OAuth code bookkeeping.

pub mod config;
pub mod executor;
pub mod migration;
pub mod oauth;
pub mod process;
pub mod status;
pub mod store;
pub mod version;

//! Venue Bridge - Core Library
//! Margin-trading execution bridge between the platform and venue terminals

// Public modules
pub mod core;
pub mod correlation;
pub mod execution;
pub mod hub;
pub mod ledger;
pub mod mirror;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testkit;

// Re-exports
pub use crate::core::{Config, Error, Result};

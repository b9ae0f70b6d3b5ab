//! Ephemeral sandbox session manager.
//!
//! Provisions short-lived isolated instances for anonymous callers, runs
//! bounded commands in them and reclaims them after a bounded lifetime.

pub mod api;
pub mod config;
pub mod db;
pub mod limits;
pub mod runtime;
pub mod session;

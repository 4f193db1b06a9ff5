//! Realtime chat synchronization engine for the HuddleSpace backend.
//!
//! The crate keeps a local chat session consistent with the server across
//! two collaborators: a push transport delivering messages as they happen,
//! and a REST API serving history, rosters, and group records. All session
//! state lives inside a single-task actor ([`engine::ChatEngine`]); see that
//! module for the concurrency model.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod logging;
pub mod registry;
pub mod router;
pub mod store;
pub mod transport;
pub mod types;
pub mod ws;

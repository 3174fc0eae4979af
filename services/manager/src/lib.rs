//! Sokovan manager library.
//!
//! This crate contains the session scheduling and lifecycle engine:
//! - Promotion handlers and the lifecycle coordinator
//! - The termination coordinator
//! - Admission validators over a point-in-time system snapshot
//! - The fair-share usage aggregator
//! - Agent heartbeat reconciliation and the agent RPC client pool
//!
//! Storage, locking, wake signals and the event bus are reached through
//! traits, with Postgres implementations in [`db`] and in-memory ones for
//! tests and local runs.

pub mod admission;
pub mod agents;
pub mod config;
pub mod db;
pub mod events;
pub mod fair_share;
pub mod scheduler;

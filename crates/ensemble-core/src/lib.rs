//! Ensemble Core — Transport-agnostic control plane for the Ensemble
//! multi-agent orchestration platform.
//!
//! This crate contains the core business logic, data models, stores, agent
//! adapters, and orchestration. It has **no HTTP framework dependency** by
//! default, making it suitable for use in:
//!
//! - HTTP servers (via `ensemble-server`)
//! - Embedded hosts (direct function calls)
//! - Tests (in-memory SQLite)
//!
//! # Feature Flags
//!
//! - `axum` — Enables `IntoResponse` impl on `ServerError` for use in axum handlers.

pub mod acp;
pub mod background;
pub mod bridge;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestration;
pub mod specialists;
pub mod state;
pub mod store;
pub mod tools;
pub mod triggers;
pub mod workflow;

// Convenience re-exports
pub use db::Database;
pub use error::ServerError;
pub use state::{AppState, AppStateInner};

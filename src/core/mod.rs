// src/core/mod.rs

//! The engine core: domain aggregates, the aggregate store, and the
//! background components (C10-C14) that operate through them. Mirrors
//! `spineldb::core`'s role as the crate's central module, re-exporting the
//! handful of types used throughout the rest of the crate.

pub mod adapters;
pub mod audit;
pub mod cloudevents;
pub mod controller;
pub mod coordination;
pub mod domain;
pub mod errors;
pub mod events;
pub mod ids;
pub mod leader;
pub mod pipeline;
pub mod ports;
pub mod retry;
pub mod scheduler;
pub mod sse;
pub mod state;
pub mod stats;
pub mod store;
pub mod topology;

pub use errors::OrchestratorError;
pub use state::EngineState;

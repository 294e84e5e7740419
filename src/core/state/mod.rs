// src/core/state/mod.rs

//! Defines the central `EngineState`, the service registry every command
//! function and background loop is handed (spec §9 design note: "the
//! service registry and coordination store are process-wide, initialized
//! at startup and torn down on shutdown; no other globals are permitted").
//! Directly modeled on `spineldb::core::state::ServerState`: one struct
//! owning every shared component, built once by `initialize` and wrapped
//! in an `Arc`.

mod core;

pub use core::EngineState;

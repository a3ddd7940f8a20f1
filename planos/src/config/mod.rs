//! Configuration module for the orchestration engine.
//!
//! All tunables live in a strongly typed config tree consumed by the engine,
//! the dispatch client, the event bus, and the policy gate. Nothing in the
//! runtime parses raw config text; the loader here produces the typed struct
//! once at process startup.

pub mod types;

pub use types::*;

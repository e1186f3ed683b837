//! Persisted per-consumer overrides and their synchronization onto a stage.

pub mod sets;
pub mod sync;

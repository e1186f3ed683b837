//! Per-consumer orchestration: compute, user edits, notices, persistence.

pub mod consumer;
pub mod persist;

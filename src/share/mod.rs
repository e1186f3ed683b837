//! Shared and unshared exposure of a resolved stage.

pub mod controller;

pub mod bounds;
pub mod classify;
pub mod extent;
pub mod notifier;

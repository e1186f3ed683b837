/// Convenience result type used across stageshare.
pub type StageResult<T> = Result<T, StageError>;

/// Top-level error taxonomy used by engine APIs.
///
/// Only [`StageError::Resolution`] (and validation failures of a resolution cycle) propagate to
/// the caller of a compute; the other kinds are recovered where they occur and surfaced through
/// reports and logs.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    /// No root layer could be obtained for a composition request.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Invalid user-provided or host-provided data (bad prim paths, locked edit targets, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// A persisted layer identifier no longer resolves to a live layer.
    #[error("stale reference: {0}")]
    StaleReference(String),

    /// A boundable prim has a time-sampled extent that a property change made stale.
    #[error("animated extent conflict: {0}")]
    AnimatedExtentConflict(String),

    /// Errors when serializing or deserializing data structures.
    #[error("serialization error: {0}")]
    Serde(String),

    /// Errors reading or writing layer sources.
    #[error("io error: {0}")]
    Io(String),

    /// Wrapped lower-level error from dependencies.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// Build a [`StageError::Resolution`] value.
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// Build a [`StageError::Validation`] value.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a [`StageError::StaleReference`] value.
    pub fn stale_reference(msg: impl Into<String>) -> Self {
        Self::StaleReference(msg.into())
    }

    /// Build a [`StageError::AnimatedExtentConflict`] value.
    pub fn animated_extent(msg: impl Into<String>) -> Self {
        Self::AnimatedExtentConflict(msg.into())
    }

    /// Build a [`StageError::Serde`] value.
    pub fn serde(msg: impl Into<String>) -> Self {
        Self::Serde(msg.into())
    }

    /// Build a [`StageError::Io`] value.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;

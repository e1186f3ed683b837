#![forbid(unsafe_code)]
//! Stage provisioning and sharing.
//!
//! Consumers resolve a composed [`Stage`] from host inputs through a process-wide
//! [`StageCache`], expose it shared or through a private wrapper, and keep persisted overrides
//! (mutes, locks, edit target, load rules) in sync with it.

pub mod foundation;
pub mod layer;
pub mod notify;
pub mod overrides;
pub mod resolve;
pub mod session;
pub mod share;
pub mod stage;

pub use foundation::core::{PrimPath, TimeCode};
pub use foundation::error::{StageError, StageResult};
pub use foundation::math::Box3d;
pub use layer::database::{LayerDatabase, SavedLayers};
pub use layer::model::{Layer, LayerContent, Value};
pub use layer::source::{JsonFileSource, LayerSource, MemorySource};
pub use layer::store::LayerStore;
pub use overrides::sets::OverrideSets;
pub use resolve::host::{
    DatabaseLayerProvider, DefaultHost, HostContext, HostOutputs, HostSnapshot, LayerProvider,
};
pub use resolve::request::{CompositionRequest, EngineOpts, IncomingStage};
pub use session::consumer::{EngineServices, EvalContext, ExposedStage, StageConsumer};
pub use session::persist::PersistedConsumer;
pub use share::controller::ShareMode;
pub use stage::cache::{CacheId, StageCache};
pub use stage::composed::Stage;
pub use stage::load_rules::{InitialLoadSet, LoadRule, LoadRules};

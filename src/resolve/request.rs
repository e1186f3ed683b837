use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::foundation::core::PrimPath;
use crate::foundation::error::{StageError, StageResult};
use crate::resolve::host::HostSnapshot;
use crate::stage::cache::CacheId;
use crate::stage::composed::Stage;
use crate::stage::load_rules::InitialLoadSet;

#[derive(Clone, Debug)]
/// Stage handed over by an upstream producer.
pub struct IncomingStage {
    /// The upstream stage.
    pub stage: Arc<Stage>,
    /// Prim path the producer exposes.
    pub prim_path: PrimPath,
}

#[derive(Clone, Debug)]
/// Inputs of one stage resolution.
pub struct CompositionRequest {
    /// Upstream stage; wins over every other source.
    pub incoming: Option<IncomingStage>,
    /// Handle into the cache's id table.
    pub cache_handle: CacheId,
    /// Root layer path, used when neither of the above yields a stage.
    pub file_path: String,
    /// Exposed prim path.
    pub prim_path: PrimPath,
    /// Payload policy flag.
    pub load_payloads: bool,
    /// Whether the consumer asked for the shared stage.
    pub share_requested: bool,
    /// Persisted name of the consumer's own root layer.
    pub root_layer_name: String,
    /// Persisted name of the consumer's own session layer.
    pub session_layer_name: String,
    /// Variant fallbacks recorded on newly opened stages.
    pub variant_fallbacks: BTreeMap<String, Vec<String>>,
}

impl CompositionRequest {
    /// Request for a plain file path, everything else defaulted.
    pub fn for_file(file_path: impl Into<String>) -> Self {
        Self {
            incoming: None,
            cache_handle: CacheId::INVALID,
            file_path: file_path.into(),
            prim_path: PrimPath::absolute_root(),
            load_payloads: true,
            share_requested: true,
            root_layer_name: String::new(),
            session_layer_name: String::new(),
            variant_fallbacks: BTreeMap::new(),
        }
    }

    /// Build the request a host snapshot describes.
    ///
    /// Malformed variant fallbacks are logged and ignored.
    pub fn from_snapshot(snapshot: &HostSnapshot, incoming: Option<IncomingStage>) -> Self {
        let variant_fallbacks = snapshot.variant_fallback_map().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring variant fallbacks");
            BTreeMap::new()
        });
        Self {
            incoming,
            cache_handle: snapshot.cache_id(),
            file_path: snapshot.file_path.clone(),
            prim_path: snapshot.parsed_prim_path(),
            load_payloads: snapshot.load_payloads,
            share_requested: snapshot.share_stage,
            root_layer_name: snapshot.root_layer_name.clone(),
            session_layer_name: snapshot.session_layer_name.clone(),
            variant_fallbacks,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Engine-wide options.
pub struct EngineOpts {
    /// Start editing in the session layer of newly resolved stages.
    pub target_session_on_open: bool,
    /// Tag of the anonymous root created for a new empty stage.
    pub anonymous_root_tag: String,
    /// Tag of an unshared wrapper root.
    pub unshared_root_tag: String,
    /// Tag of session layers created by the engine.
    pub session_tag: String,
    /// Payload set every cached stage is opened with.
    pub initial_load_set: InitialLoadSet,
}

impl Default for EngineOpts {
    fn default() -> Self {
        Self {
            target_session_on_open: false,
            anonymous_root_tag: "anonymousLayer".to_string(),
            unshared_root_tag: "unshareableLayer".to_string(),
            session_tag: "session".to_string(),
            initial_load_set: InitialLoadSet::LoadNone,
        }
    }
}

impl EngineOpts {
    /// Load options from a JSON file; missing fields keep their defaults.
    pub fn from_path(path: impl AsRef<Path>) -> StageResult<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| StageError::io(format!("read '{}': {e}", path.display())))?;
        serde_json::from_str(&s)
            .map_err(|e| StageError::serde(format!("parse '{}': {e}", path.display())))
    }
}

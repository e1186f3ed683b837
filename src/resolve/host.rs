use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::foundation::core::{PrimPath, TimeCode};
use crate::foundation::error::{StageError, StageResult};
use crate::layer::database::LayerDatabase;
use crate::layer::model::Layer;
use crate::overrides::sets::OverrideSets;
use crate::stage::cache::CacheId;
use crate::stage::composed::Stage;
use crate::stage::load_rules::LoadRules;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Read-only view of the host fields a consumer is computed from.
pub struct HostSnapshot {
    /// File path of the root layer; empty or an anonymous identifier for a new stage.
    pub file_path: String,
    /// Exposed prim path; empty means the absolute root.
    pub prim_path: String,
    /// Comma-joined prim paths hidden from dependent views.
    pub exclude_prim_paths: String,
    /// Whether payloads are loaded when no explicit rules exist.
    pub load_payloads: bool,
    /// Whether the consumer exposes the shared stage directly.
    pub share_stage: bool,
    /// Handle of a stage registered in the cache's id table; `-1` for none.
    pub stage_cache_id: i32,
    /// JSON object mapping variant set names to fallback lists.
    pub variant_fallbacks: String,
    /// Persisted muted layer identifiers.
    pub muted_layers: Vec<String>,
    /// Persisted locked layer identifiers.
    pub locked_layers: Vec<String>,
    /// Persisted edit target identifier; empty for none.
    pub edit_target_layer_id: String,
    /// Evaluation time.
    pub time: f64,
    /// Persisted identifier of the consumer's own root layer.
    pub root_layer_name: String,
    /// Persisted identifier of the consumer's own session layer.
    pub session_layer_name: String,
    /// Persisted per-prim load rules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_rules: Option<LoadRules>,
}

impl Default for HostSnapshot {
    fn default() -> Self {
        Self {
            file_path: String::new(),
            prim_path: String::new(),
            exclude_prim_paths: String::new(),
            load_payloads: true,
            share_stage: true,
            stage_cache_id: -1,
            variant_fallbacks: String::new(),
            muted_layers: Vec::new(),
            locked_layers: Vec::new(),
            edit_target_layer_id: String::new(),
            time: 0.0,
            root_layer_name: String::new(),
            session_layer_name: String::new(),
            load_rules: None,
        }
    }
}

impl HostSnapshot {
    /// Load a snapshot from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> StageResult<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| StageError::io(format!("read '{}': {e}", path.display())))?;
        serde_json::from_str(&s)
            .map_err(|e| StageError::serde(format!("parse '{}': {e}", path.display())))
    }

    /// Exposed prim path: the absolute root when empty, the empty path when malformed.
    pub fn parsed_prim_path(&self) -> PrimPath {
        let s = self.prim_path.trim();
        if s.is_empty() {
            return PrimPath::absolute_root();
        }
        match PrimPath::parse(s) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(prim_path = s, error = %e, "malformed prim path");
                PrimPath::empty()
            }
        }
    }

    /// Excluded prim paths. Malformed entries are skipped.
    pub fn excluded_prim_paths(&self) -> Vec<PrimPath> {
        self.exclude_prim_paths
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| match PrimPath::parse(s) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(path = s, error = %e, "skipping malformed excluded prim path");
                    None
                }
            })
            .collect()
    }

    /// Variant fallbacks as a map. An empty string yields an empty map.
    pub fn variant_fallback_map(&self) -> StageResult<BTreeMap<String, Vec<String>>> {
        if self.variant_fallbacks.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&self.variant_fallbacks)
            .map_err(|e| StageError::serde(format!("variant fallbacks: {e}")))
    }

    /// The stage cache handle.
    pub fn cache_id(&self) -> CacheId {
        CacheId::from_raw(i64::from(self.stage_cache_id))
    }

    /// Evaluation time as a time code.
    pub fn time_code(&self) -> TimeCode {
        TimeCode::At(self.time)
    }

    /// Persisted overrides.
    pub fn overrides(&self) -> OverrideSets {
        OverrideSets {
            load_rules: self.load_rules.clone(),
            muted_layers: self.muted_layers.iter().cloned().collect(),
            locked_layers: self.locked_layers.iter().cloned().collect(),
            edit_target: Some(self.edit_target_layer_id.clone()).filter(|s| !s.is_empty()),
        }
    }

    /// Write `overrides` back into the persisted fields.
    pub fn record_overrides(&mut self, overrides: &OverrideSets) {
        self.load_rules = overrides.load_rules.clone();
        self.muted_layers = overrides.muted_layers.iter().cloned().collect();
        self.locked_layers = overrides.locked_layers.iter().cloned().collect();
        self.edit_target_layer_id = overrides.edit_target.clone().unwrap_or_default();
    }
}

/// Callbacks into the host document.
pub trait HostContext: Send + Sync {
    /// Resolve a trimmed, non-empty `path` against the document location.
    fn resolve_path(&self, path: &str) -> String {
        path.to_string()
    }

    /// Whether something outside the consumer already consumes the stage registered as `id`.
    fn is_cache_entry_consumed(&self, _id: CacheId) -> bool {
        false
    }

    /// Mark dependent views for redraw.
    fn invalidate_view(&self) {}
}

#[derive(Debug, Default)]
/// Host with an optional document directory, an explicit consumed-handle set and an
/// invalidation counter.
pub struct DefaultHost {
    document_dir: Option<PathBuf>,
    consumed: Mutex<BTreeSet<CacheId>>,
    invalidations: AtomicUsize,
}

impl DefaultHost {
    /// Create a host without a document location.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a host resolving relative paths against `dir`.
    pub fn with_document_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            document_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Record that `id` is consumed elsewhere.
    pub fn mark_consumed(&self, id: CacheId) {
        self.consumed.lock().insert(id);
    }

    /// Number of view invalidations requested so far.
    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl HostContext for DefaultHost {
    fn resolve_path(&self, path: &str) -> String {
        let p = Path::new(path);
        match &self.document_dir {
            Some(dir) if p.is_relative() => dir.join(p).to_string_lossy().into_owned(),
            _ => path.to_string(),
        }
    }

    fn is_cache_entry_consumed(&self, id: CacheId) -> bool {
        self.consumed.lock().contains(&id)
    }

    fn invalidate_view(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Storage the consumer's own root and session layers are recovered from.
///
/// Every method defaults to "nothing stored".
pub trait LayerProvider: Send + Sync {
    /// Root layer persisted under `name`.
    fn compute_root_layer(&self, _name: &str) -> Option<Arc<Layer>> {
        None
    }

    /// Session layer persisted under `name`.
    fn compute_session_layer(&self, _name: &str) -> Option<Arc<Layer>> {
        None
    }

    /// Layer persisted under `identifier`, which may have reloaded under a new identifier.
    fn find_persisted(&self, _identifier: &str) -> Option<Arc<Layer>> {
        None
    }

    /// Persisted identifier to current identifier for every reloaded layer.
    fn name_map(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

#[derive(Clone, Copy, Debug, Default)]
/// Provider with nothing stored.
pub struct NoLayerProvider;

impl LayerProvider for NoLayerProvider {}

#[derive(Clone, Debug)]
/// Provider backed by a [`LayerDatabase`].
pub struct DatabaseLayerProvider {
    db: Arc<LayerDatabase>,
}

impl DatabaseLayerProvider {
    /// Wrap `db`.
    pub fn new(db: Arc<LayerDatabase>) -> Self {
        Self { db }
    }

    /// The wrapped database.
    pub fn database(&self) -> &Arc<LayerDatabase> {
        &self.db
    }

    fn named(&self, name: &str) -> Option<Arc<Layer>> {
        if name.is_empty() {
            return None;
        }
        self.db.find_layer(name)
    }
}

impl LayerProvider for DatabaseLayerProvider {
    fn compute_root_layer(&self, name: &str) -> Option<Arc<Layer>> {
        self.named(name)
    }

    fn compute_session_layer(&self, name: &str) -> Option<Arc<Layer>> {
        self.named(name)
    }

    fn find_persisted(&self, identifier: &str) -> Option<Arc<Layer>> {
        self.named(identifier)
    }

    fn name_map(&self) -> BTreeMap<String, String> {
        self.db.layer_name_map()
    }
}

#[derive(Clone, Debug)]
/// Derived values written back to the host.
pub struct HostOutputs {
    /// The exposed stage.
    pub out_stage: Option<Arc<Stage>>,
    /// Copy of the input time.
    pub out_time: f64,
    /// Handle of the exposed stage in the cache's id table.
    pub out_stage_cache_id: CacheId,
    /// Update notices seen, resyncs included.
    pub update_counter: i64,
    /// Resync notices seen.
    pub resync_counter: i64,
    /// Replacement for the input file path, when the resolved root no longer matches it.
    pub file_path: Option<String>,
}

impl Default for HostOutputs {
    fn default() -> Self {
        Self {
            out_stage: None,
            out_time: 0.0,
            out_stage_cache_id: CacheId::INVALID,
            update_counter: 0,
            resync_counter: 0,
            file_path: None,
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/resolve/host.rs"]
mod tests;

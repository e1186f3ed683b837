use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::foundation::error::{StageError, StageResult};
use crate::layer::model::{Layer, LayerContent};
use crate::layer::store::LayerStore;
use crate::layer::sublayers::sublayer_refs;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
/// One serialized layer: its identifier at save time plus its edits.
pub struct SavedLayer {
    /// Identifier at save time.
    pub identifier: String,
    /// Whether the layer was anonymous.
    pub anonymous: bool,
    /// Serialized content; `None` when the layer had no edits worth saving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<LayerContent>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
/// Layers serialized alongside a host document.
pub struct SavedLayers {
    /// Saved layers, strongest first per stack.
    pub layers: Vec<SavedLayer>,
}

impl SavedLayers {
    /// Load saved layers from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> StageResult<Self> {
        let path = path.as_ref();
        let f = std::fs::File::open(path)
            .map_err(|e| StageError::io(format!("open '{}': {e}", path.display())))?;
        let r = std::io::BufReader::new(f);
        serde_json::from_reader(r)
            .map_err(|e| StageError::serde(format!("parse '{}': {e}", path.display())))
    }

    /// Write saved layers to a JSON file.
    pub fn to_path(&self, path: impl AsRef<Path>) -> StageResult<()> {
        let path = path.as_ref();
        let f = std::fs::File::create(path)
            .map_err(|e| StageError::io(format!("create '{}': {e}", path.display())))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(f), self)
            .map_err(|e| StageError::serde(format!("write '{}': {e}", path.display())))
    }

    /// Return `true` when nothing was saved.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Persisted-identifier to layer table.
///
/// Layers are registered under their current identifier and, when it differs, under the
/// identifier they were persisted with. Anonymous layers reloaded from a [`SavedLayers`] get new
/// identifiers; the table is how persisted references find them again.
pub struct LayerDatabase {
    store: Arc<LayerStore>,
    entries: Mutex<BTreeMap<String, Arc<Layer>>>,
}

impl std::fmt::Debug for LayerDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerDatabase")
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl LayerDatabase {
    /// Create an empty database over `store`.
    pub fn new(store: Arc<LayerStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// The layer store used to recreate layers.
    pub fn store(&self) -> &Arc<LayerStore> {
        &self.store
    }

    /// Register `layer` under its identifier and under `persisted_id` when different.
    pub fn add_layer(&self, layer: Arc<Layer>, persisted_id: &str) {
        let mut entries = self.entries.lock();
        if !persisted_id.is_empty() && persisted_id != layer.identifier() {
            entries.insert(persisted_id.to_string(), layer.clone());
        }
        entries.insert(layer.identifier().to_string(), layer);
    }

    /// Layer registered under `identifier`.
    pub fn find_layer(&self, identifier: &str) -> Option<Arc<Layer>> {
        self.entries.lock().get(identifier).cloned()
    }

    /// Unregister `layer` and, recursively, its registered sublayers.
    pub fn remove_layer(&self, layer: &Arc<Layer>) {
        let mut visited = HashSet::new();
        self.remove_recursive(layer, &mut visited);
    }

    fn remove_recursive(&self, layer: &Arc<Layer>, visited: &mut HashSet<String>) {
        if !visited.insert(layer.identifier().to_string()) {
            return;
        }
        for id in layer.sublayers() {
            if let Some(child) = self.find_layer(&id) {
                self.remove_recursive(&child, visited);
            }
        }
        self.entries.lock().retain(|_, l| !Arc::ptr_eq(l, layer));
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Return `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Persisted identifiers whose layer now has a different identifier, mapped to the current
    /// identifier.
    pub fn layer_name_map(&self) -> BTreeMap<String, String> {
        self.entries
            .lock()
            .iter()
            .filter(|(name, l)| name.as_str() != l.identifier())
            .map(|(name, l)| (name.clone(), l.identifier().to_string()))
            .collect()
    }

    /// Rewrite `parent`'s sublayer identifiers that name registered layers under an old
    /// identifier. Returns `true` when the list changed.
    pub fn remap_sublayer_paths(&self, parent: &Layer) -> bool {
        let mut paths = parent.sublayers();
        let mut modified = false;
        for p in &mut paths {
            if let Some(sub) = self.find_layer(p)
                && sub.identifier() != p.as_str()
            {
                *p = sub.identifier().to_string();
                modified = true;
            }
        }
        if modified {
            parent.set_sublayers(paths);
        }
        modified
    }

    /// Capture the layers a stage needs persisted and register them.
    ///
    /// The session layer stack is saved in full; root stack layers are saved when anonymous or
    /// dirty. File-backed layers without edits are recorded without content.
    pub fn save_stage(&self, root: &Arc<Layer>, session: &Arc<Layer>) -> SavedLayers {
        let mut out = SavedLayers::default();
        let mut seen = HashSet::new();
        for layer in sublayer_refs(&self.store, std::slice::from_ref(session)) {
            if seen.insert(layer.identifier().to_string()) {
                out.layers.push(saved_entry(&layer, true));
                self.add_layer(layer, "");
            }
        }
        for layer in sublayer_refs(&self.store, std::slice::from_ref(root)) {
            if seen.insert(layer.identifier().to_string()) {
                let with_edits = layer.is_anonymous() || layer.is_dirty();
                out.layers.push(saved_entry(&layer, with_edits));
                self.add_layer(layer, "");
            }
        }
        tracing::debug!(layers = out.layers.len(), "saved stage layers");
        out
    }

    /// Recreate saved layers, register them under their persisted identifiers and remap
    /// sublayer references to the recreated identifiers.
    pub fn load(&self, saved: &SavedLayers) -> Vec<Arc<Layer>> {
        let mut created = Vec::with_capacity(saved.layers.len());
        for entry in &saved.layers {
            if entry.identifier.is_empty() {
                tracing::warn!("skipping saved layer with an empty identifier");
                continue;
            }
            let layer = if entry.anonymous {
                let tag = display_tag(&entry.identifier);
                self.store
                    .create_anonymous_with(tag, entry.content.clone().unwrap_or_default())
            } else {
                match self.store.find_or_open(&entry.identifier) {
                    Ok(layer) => {
                        if let Some(content) = &entry.content {
                            layer.replace_content(content.clone());
                        }
                        layer
                    }
                    Err(e) => {
                        let Some(content) = &entry.content else {
                            tracing::warn!(
                                layer = %entry.identifier,
                                error = %e,
                                "saved layer not found"
                            );
                            continue;
                        };
                        tracing::warn!(
                            layer = %entry.identifier,
                            error = %e,
                            "reloading saved layer content in memory"
                        );
                        self.store
                            .create_anonymous_with(display_tag(&entry.identifier), content.clone())
                    }
                }
            };
            self.add_layer(layer.clone(), &entry.identifier);
            created.push(layer);
        }
        for layer in &created {
            self.remap_sublayer_paths(layer);
        }
        created
    }
}

fn saved_entry(layer: &Layer, with_edits: bool) -> SavedLayer {
    SavedLayer {
        identifier: layer.identifier().to_string(),
        anonymous: layer.is_anonymous(),
        content: with_edits.then(|| layer.content()),
    }
}

/// Tag part of an anonymous identifier (`anon:<n>:<tag>`), or the identifier itself.
fn display_tag(identifier: &str) -> &str {
    match identifier.strip_prefix(crate::layer::model::ANONYMOUS_PREFIX) {
        Some(rest) => rest.split_once(':').map_or(rest, |(_, tag)| tag),
        None => Path::new(identifier)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(identifier),
    }
}

#[cfg(test)]
#[path = "../../tests/unit/layer/database.rs"]
mod tests;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::foundation::error::{StageError, StageResult};
use crate::layer::database::{LayerDatabase, SavedLayers};
use crate::layer::model::{Layer, is_anonymous_identifier};
use crate::layer::store::LayerStore;
use crate::resolve::host::HostSnapshot;
use crate::session::consumer::{EngineServices, StageConsumer};
use crate::share::controller::ShareMode;
use crate::stage::cache::ShareClass;

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
/// A consumer as saved with the host document: its inputs plus the layers it needs.
pub struct PersistedConsumer {
    /// Inputs, with overrides and own-layer names filled in.
    pub snapshot: HostSnapshot,
    /// Layers to recreate on load.
    pub layers: SavedLayers,
}

impl PersistedConsumer {
    /// Load from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> StageResult<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| StageError::io(format!("read '{}': {e}", path.display())))?;
        serde_json::from_str(&s)
            .map_err(|e| StageError::serde(format!("parse '{}': {e}", path.display())))
    }

    /// Write to a JSON file.
    pub fn to_path(&self, path: impl AsRef<Path>) -> StageResult<()> {
        let path = path.as_ref();
        let s = serde_json::to_string_pretty(self)
            .map_err(|e| StageError::serde(format!("serialize '{}': {e}", path.display())))?;
        std::fs::write(path, s)
            .map_err(|e| StageError::io(format!("write '{}': {e}", path.display())))
    }

    /// Recreate the saved layers in `db` and build a consumer over them.
    ///
    /// `services` should look persisted names up in the same `db`.
    pub fn restore(&self, services: EngineServices, db: &LayerDatabase) -> StageConsumer {
        let created = db.load(&self.layers);
        tracing::debug!(layers = created.len(), "restored consumer layers");
        StageConsumer::new(services, self.snapshot.clone())
    }
}

impl StageConsumer {
    /// Save this consumer into `db`.
    ///
    /// The layers of the active mode (the shared stage's root and session, or the unshared
    /// wrapper's) are saved and their identifiers recorded as the own-layer names. The current
    /// edit target is recorded in the overrides.
    pub fn persist(&self, db: &LayerDatabase) -> PersistedConsumer {
        let mut snapshot = self.snapshot().clone();
        let mut overrides = self.overrides().clone();
        if let Some(stage) = self.stage() {
            overrides.edit_target = Some(stage.edit_target().identifier().to_string());
        }
        snapshot.record_overrides(&overrides);

        let own_layers = match self.share_mode() {
            ShareMode::Unshared => self
                .share()
                .wrapper_root()
                .cloned()
                .zip(self.share().wrapper_session().cloned()),
            _ => self
                .shared_stage()
                .map(|s| (s.root_layer().clone(), s.session_layer().clone())),
        };
        let Some((root, session)) = own_layers else {
            return PersistedConsumer {
                snapshot,
                layers: SavedLayers::default(),
            };
        };
        let layers = db.save_stage(&root, &session);
        snapshot.root_layer_name = root.identifier().to_string();
        snapshot.session_layer_name = session.identifier().to_string();
        PersistedConsumer { snapshot, layers }
    }

    /// New consumer over a copy of this one's resolved stage.
    ///
    /// The session layer is copied into a new anonymous layer. An anonymous root is deep-copied
    /// with its anonymous sublayers; a file-backed root is shared. The copy starts from a stage
    /// registered in the cache's id table so its first compute finds it.
    pub fn duplicate(&self) -> StageResult<StageConsumer> {
        let services = self.services().clone();
        let mut dup = StageConsumer::new(services.clone(), self.snapshot().clone());
        let Some(stage) = self.shared_stage() else {
            return Ok(dup);
        };
        let store = services.cache.store();

        let session = store.create_anonymous_with(
            &services.opts.session_tag,
            stage.session_layer().content(),
        );
        let src_root = stage.root_layer();
        let mut copies = BTreeMap::new();
        let root = if src_root.is_anonymous() {
            deep_copy_anonymous(store, src_root, &mut copies)
        } else {
            src_root.clone()
        };

        // The target follows its copy; layers that were not copied are shared.
        let src_target = stage.edit_target();
        let target = if Arc::ptr_eq(&src_target, stage.session_layer()) {
            Some(session.clone())
        } else if let Some(copy) = copies.get(src_target.identifier()) {
            Some(copy.clone())
        } else if !src_root.is_anonymous() || !src_target.is_anonymous() {
            Some(src_target)
        } else {
            None
        };

        let copy = services.cache.open(
            &root,
            Some(&session),
            services.opts.initial_load_set,
            ShareClass::Shared,
        );
        if let Some(target) = &target
            && let Err(e) = copy.set_edit_target(target)
        {
            tracing::warn!(error = %e, "edit target not carried over");
        }
        let id = services.cache.insert(&copy);
        let raw = i32::try_from(id.as_raw())
            .map_err(|_| StageError::resolution("stage cache handle out of range"))?;
        dup.set_stage_cache_id(raw);
        if root.is_anonymous() {
            dup.set_file_path(root.identifier());
        }
        dup.seed(target, root.is_anonymous().then(|| root.clone()));
        tracing::debug!(
            root = root.identifier(),
            session = session.identifier(),
            "duplicated consumer"
        );
        Ok(dup)
    }
}

fn deep_copy_anonymous(
    store: &LayerStore,
    layer: &Arc<Layer>,
    copies: &mut BTreeMap<String, Arc<Layer>>,
) -> Arc<Layer> {
    if let Some(copy) = copies.get(layer.identifier()) {
        return copy.clone();
    }
    let copy = store.create_anonymous_with(layer.tag(), layer.content());
    copies.insert(layer.identifier().to_string(), copy.clone());

    let mut subs = layer.sublayers();
    let mut rewritten = false;
    for id in &mut subs {
        if !is_anonymous_identifier(id) {
            continue;
        }
        let Some(sub) = store.find(id) else {
            continue;
        };
        let sub_copy = deep_copy_anonymous(store, &sub, copies);
        *id = sub_copy.identifier().to_string();
        rewritten = true;
    }
    if rewritten {
        copy.set_sublayers(subs);
    }
    copy
}

#[cfg(test)]
#[path = "../../tests/unit/session/persist.rs"]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::foundation::core::{PrimPath, TimeCode};
use crate::foundation::error::{StageError, StageResult};
use crate::layer::model::{Attribute, Layer, LayerChange, LayerObserver, Value};
use crate::layer::store::LayerStore;
use crate::stage::load_rules::{InitialLoadSet, LoadRules};
use crate::stage::notice::StageNotice;

#[derive(Clone, Debug, PartialEq)]
/// Prim as seen through the composed layer stack.
pub struct ComposedPrim {
    /// Prim path.
    pub path: PrimPath,
    /// Strongest non-empty type name.
    pub type_name: String,
    /// Whether any layer gives the prim a payload.
    pub has_payload: bool,
}

#[derive(Debug)]
struct StageState {
    edit_target: Arc<Layer>,
    muted: BTreeSet<String>,
    load_rules: LoadRules,
    fps: Option<f64>,
    tcps: Option<f64>,
    variant_fallbacks: BTreeMap<String, Vec<String>>,
    layer_stack: Vec<Arc<Layer>>,
    // Muted layers stay alive while a sublayer list still names them.
    retained: Vec<Arc<Layer>>,
}

/// A composed stage over a root layer and a session layer.
///
/// The layer stack is the session layer and its sublayers followed by the root layer and its
/// sublayers, strongest first, with muted layers (and what only they bring in) left out.
/// Mutations of stack layers are reported to subscribers as [`StageNotice`]s.
pub struct Stage {
    store: Arc<LayerStore>,
    root: Arc<Layer>,
    session: Arc<Layer>,
    load_set: InitialLoadSet,
    state: RwLock<StageState>,
    subscribers: Mutex<Vec<(u64, mpsc::Sender<StageNotice>)>>,
    next_subscriber: AtomicU64,
    this: Weak<Stage>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("root", &self.root.identifier())
            .field("session", &self.session.identifier())
            .field("load_set", &self.load_set)
            .finish_non_exhaustive()
    }
}

impl Stage {
    /// Compose a stage over `root` and `session`.
    ///
    /// The edit target starts on the root layer; the load rules start from `load_set`.
    pub fn open(
        store: Arc<LayerStore>,
        root: Arc<Layer>,
        session: Arc<Layer>,
        load_set: InitialLoadSet,
    ) -> Arc<Stage> {
        let stage = Arc::new_cyclic(|this| Stage {
            store,
            root: root.clone(),
            session,
            load_set,
            state: RwLock::new(StageState {
                edit_target: root,
                muted: BTreeSet::new(),
                load_rules: LoadRules::for_initial_set(load_set),
                fps: None,
                tcps: None,
                variant_fallbacks: BTreeMap::new(),
                layer_stack: Vec::new(),
                retained: Vec::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            this: this.clone(),
        });
        stage.rebuild_layer_stack();
        tracing::debug!(
            root = stage.root.identifier(),
            session = stage.session.identifier(),
            "opened stage"
        );
        stage
    }

    /// Layer store the stage resolves sublayers through.
    pub fn store(&self) -> &Arc<LayerStore> {
        &self.store
    }

    /// Root layer.
    pub fn root_layer(&self) -> &Arc<Layer> {
        &self.root
    }

    /// Session layer.
    pub fn session_layer(&self) -> &Arc<Layer> {
        &self.session
    }

    /// Payload set the stage was opened with.
    pub fn initial_load_set(&self) -> InitialLoadSet {
        self.load_set
    }

    /// Current layer stack, strongest first.
    pub fn layer_stack(&self) -> Vec<Arc<Layer>> {
        self.state.read().layer_stack.clone()
    }

    /// Return `true` when `layer` is part of the current (unmuted) layer stack.
    pub fn has_layer(&self, layer: &Arc<Layer>) -> bool {
        self.state
            .read()
            .layer_stack
            .iter()
            .any(|l| Arc::ptr_eq(l, layer))
    }

    /// Layer in the current stack with identifier `identifier`.
    pub fn layer_by_identifier(&self, identifier: &str) -> Option<Arc<Layer>> {
        self.state
            .read()
            .layer_stack
            .iter()
            .find(|l| l.identifier() == identifier)
            .cloned()
    }

    fn compute_layer_stack(&self, muted: &BTreeSet<String>) -> Vec<Arc<Layer>> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        for top in [&self.session, &self.root] {
            self.collect_unmuted(top.clone(), muted, &mut visited, &mut out);
        }
        out
    }

    fn collect_unmuted(
        &self,
        layer: Arc<Layer>,
        muted: &BTreeSet<String>,
        visited: &mut HashSet<String>,
        out: &mut Vec<Arc<Layer>>,
    ) {
        if !visited.insert(layer.identifier().to_string()) {
            return;
        }
        let subs = layer.sublayers();
        out.push(layer);
        for id in subs {
            if muted.contains(&id) {
                continue;
            }
            match self.store.find_or_open(&id) {
                Ok(sub) => self.collect_unmuted(sub, muted, visited, out),
                Err(e) => tracing::debug!(sublayer = %id, error = %e, "sublayer not composed"),
            }
        }
    }

    fn rebuild_layer_stack(&self) {
        let muted = self.state.read().muted.clone();
        let stack = self.compute_layer_stack(&muted);
        let retained = if muted.is_empty() {
            Vec::new()
        } else {
            self.compute_layer_stack(&BTreeSet::new())
        };
        let observer: Weak<dyn LayerObserver> = self.this.clone();
        for layer in &stack {
            layer.add_observer(observer.clone());
        }
        let mut st = self.state.write();
        st.layer_stack = stack;
        st.retained = retained;
    }

    /// Layer receiving authored opinions.
    pub fn edit_target(&self) -> Arc<Layer> {
        self.state.read().edit_target.clone()
    }

    /// Layer the edit target falls back to: the root layer when editable, else the session layer.
    pub fn default_edit_target(&self) -> Arc<Layer> {
        if self.root.permission_to_edit() {
            self.root.clone()
        } else {
            self.session.clone()
        }
    }

    /// Move the edit target to `layer`, which must be in the layer stack.
    pub fn set_edit_target(&self, layer: &Arc<Layer>) -> StageResult<()> {
        if !self.has_layer(layer) {
            return Err(StageError::validation(format!(
                "layer '{}' is not part of the stage layer stack",
                layer.identifier()
            )));
        }
        let changed = {
            let mut st = self.state.write();
            if Arc::ptr_eq(&st.edit_target, layer) {
                false
            } else {
                st.edit_target = layer.clone();
                true
            }
        };
        if changed {
            self.send(StageNotice::EditTargetChanged {
                identifier: layer.identifier().to_string(),
            });
        }
        Ok(())
    }

    /// Muted layer identifiers, sorted.
    pub fn muted_layers(&self) -> Vec<String> {
        self.state.read().muted.iter().cloned().collect()
    }

    /// Return `true` when `identifier` is muted.
    pub fn is_layer_muted(&self, identifier: &str) -> bool {
        self.state.read().muted.contains(identifier)
    }

    /// Mute `mute` and unmute `unmute` in one step.
    ///
    /// Root and session layers cannot be muted. When the edit target leaves the layer stack it
    /// moves to [`Stage::default_edit_target`].
    pub fn mute_and_unmute_layers(&self, mute: &[String], unmute: &[String]) {
        let (muted, unmuted) = {
            let mut st = self.state.write();
            let mut muted = Vec::new();
            let mut unmuted = Vec::new();
            for id in mute {
                if id.is_empty()
                    || id == self.root.identifier()
                    || id == self.session.identifier()
                {
                    tracing::debug!(layer = %id, "refusing to mute root or session layer");
                    continue;
                }
                if st.muted.insert(id.clone()) {
                    muted.push(id.clone());
                }
            }
            for id in unmute {
                if st.muted.remove(id) {
                    unmuted.push(id.clone());
                }
            }
            (muted, unmuted)
        };
        if muted.is_empty() && unmuted.is_empty() {
            return;
        }
        self.rebuild_layer_stack();

        let target = self.edit_target();
        if !self.has_layer(&target) {
            let fallback = self.default_edit_target();
            tracing::debug!(
                from = target.identifier(),
                to = fallback.identifier(),
                "edit target muted, retargeting"
            );
            self.state.write().edit_target = fallback.clone();
            self.send(StageNotice::EditTargetChanged {
                identifier: fallback.identifier().to_string(),
            });
        }
        self.send(StageNotice::LayerMutingChanged { muted, unmuted });
        self.send(StageNotice::ObjectsChanged {
            resynced: vec![PrimPath::absolute_root()],
            changed_info_only: vec![],
        });
    }

    /// Mute one layer.
    pub fn mute_layer(&self, identifier: &str) {
        self.mute_and_unmute_layers(&[identifier.to_string()], &[]);
    }

    /// Unmute one layer.
    pub fn unmute_layer(&self, identifier: &str) {
        self.mute_and_unmute_layers(&[], &[identifier.to_string()]);
    }

    /// Current load rules.
    pub fn load_rules(&self) -> LoadRules {
        self.state.read().load_rules.clone()
    }

    /// Replace the load rules. Returns `false` when they were already equal.
    pub fn set_load_rules(&self, rules: LoadRules) -> bool {
        {
            let mut st = self.state.write();
            if st.load_rules == rules {
                return false;
            }
            st.load_rules = rules;
        }
        self.send(StageNotice::ObjectsChanged {
            resynced: vec![PrimPath::absolute_root()],
            changed_info_only: vec![],
        });
        true
    }

    fn update_load_rules(&self, f: impl FnOnce(&mut LoadRules) -> bool) -> bool {
        let mut rules = self.load_rules();
        if !f(&mut rules) {
            return false;
        }
        self.set_load_rules(rules)
    }

    /// Load `path` and everything beneath it.
    pub fn load_with_descendants(&self, path: &PrimPath) -> bool {
        self.update_load_rules(|r| {
            r.load_with_descendants(path);
            true
        })
    }

    /// Unload `path` and everything beneath it.
    pub fn unload(&self, path: &PrimPath) -> bool {
        self.update_load_rules(|r| {
            r.unload(path);
            true
        })
    }

    /// Reproduce the load rules of `from` at `to`.
    pub fn duplicate_load_rules(&self, from: &PrimPath, to: &PrimPath) -> bool {
        self.update_load_rules(|r| r.duplicate_rules(from, to))
    }

    /// Move the load rules of `from` to `to`.
    pub fn move_load_rules(&self, from: &PrimPath, to: &PrimPath) -> bool {
        self.update_load_rules(|r| r.move_rules(from, to))
    }

    /// Drop the load rules at and beneath `path`.
    pub fn remove_load_rules_for_path(&self, path: &PrimPath) -> bool {
        self.update_load_rules(|r| r.remove_rules_for_path(path))
    }

    /// Stage-level frames per second, falling back to session then root layer metadata.
    pub fn frames_per_second(&self) -> Option<f64> {
        let fps = self.state.read().fps;
        fps.or_else(|| self.session.fps()).or_else(|| self.root.fps())
    }

    /// Set stage-level frames per second.
    pub fn set_frames_per_second(&self, fps: f64) {
        self.state.write().fps = Some(fps);
    }

    /// Stage-level timecodes per second, falling back to session then root layer metadata.
    pub fn time_codes_per_second(&self) -> Option<f64> {
        let tcps = self.state.read().tcps;
        tcps.or_else(|| self.session.tcps())
            .or_else(|| self.root.tcps())
    }

    /// Set stage-level timecodes per second.
    pub fn set_time_codes_per_second(&self, tcps: f64) {
        self.state.write().tcps = Some(tcps);
    }

    /// Variant fallbacks recorded when the stage was opened.
    pub fn variant_fallbacks(&self) -> BTreeMap<String, Vec<String>> {
        self.state.read().variant_fallbacks.clone()
    }

    /// Record variant fallbacks.
    pub fn set_variant_fallbacks(&self, fallbacks: BTreeMap<String, Vec<String>>) {
        self.state.write().variant_fallbacks = fallbacks;
    }

    fn compose_all(&self) -> BTreeMap<PrimPath, ComposedPrim> {
        let stack = self.layer_stack();
        let mut out: BTreeMap<PrimPath, ComposedPrim> = BTreeMap::new();
        // Weakest first so stronger type names win.
        for layer in stack.iter().rev() {
            layer.with_content(|c| {
                for (path, spec) in &c.prims {
                    for anc in path.ancestors_inclusive() {
                        if anc.is_absolute_root() {
                            break;
                        }
                        out.entry(anc.clone()).or_insert_with(|| ComposedPrim {
                            path: anc,
                            type_name: String::new(),
                            has_payload: false,
                        });
                    }
                    if let Some(entry) = out.get_mut(path) {
                        if !spec.type_name.is_empty() {
                            entry.type_name = spec.type_name.clone();
                        }
                        entry.has_payload |= spec.has_payload;
                    }
                }
            });
        }
        let rules = self.load_rules();
        let unloaded: Vec<PrimPath> = out
            .values()
            .filter(|p| p.has_payload && !rules.is_loaded(&p.path))
            .map(|p| p.path.clone())
            .collect();
        out.retain(|path, _| !unloaded.iter().any(|u| path != u && path.has_prefix(u)));
        out
    }

    /// Every populated prim, sorted by path.
    pub fn prims(&self) -> Vec<ComposedPrim> {
        self.compose_all().into_values().collect()
    }

    /// Populated prim at `path`.
    pub fn prim(&self, path: &PrimPath) -> Option<ComposedPrim> {
        if !path.is_absolute_root_or_prim_path() || path.is_absolute_root() {
            return None;
        }
        self.compose_all().remove(path)
    }

    /// Return `true` when a prim is populated at `path`.
    pub fn has_prim(&self, path: &PrimPath) -> bool {
        self.prim(path).is_some()
    }

    /// Strongest attribute opinion carrying a value at `attr_path`.
    pub fn attribute(&self, attr_path: &PrimPath) -> Option<Attribute> {
        if !attr_path.is_property_path() || !self.has_prim(&attr_path.prim_path()) {
            return None;
        }
        self.layer_stack()
            .iter()
            .filter_map(|l| l.attribute(attr_path))
            .find(Attribute::has_value)
    }

    /// Attribute names authored on `prim` anywhere in the layer stack.
    pub fn attribute_names(&self, prim: &PrimPath) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for layer in self.layer_stack() {
            if let Some(spec) = layer.prim(prim) {
                names.extend(spec.attributes.into_keys());
            }
        }
        names
    }

    /// Resolved value of `attr_path` at `time`.
    pub fn attribute_value(&self, attr_path: &PrimPath, time: TimeCode) -> Option<Value> {
        self.attribute(attr_path)
            .and_then(|a| a.value_at(time).cloned())
    }

    fn authoring_target(&self) -> StageResult<Arc<Layer>> {
        let target = self.edit_target();
        if !target.permission_to_edit() {
            return Err(StageError::validation(format!(
                "edit target '{}' is locked",
                target.identifier()
            )));
        }
        Ok(target)
    }

    /// Define a prim in the edit target.
    pub fn define_prim(&self, path: &PrimPath, type_name: &str) -> StageResult<()> {
        self.authoring_target()?.define_prim(path, type_name)
    }

    /// Give the prim at `path` a payload in the edit target.
    pub fn set_payload(&self, path: &PrimPath) -> StageResult<()> {
        self.authoring_target()?.set_payload(path, true)
    }

    /// Remove the prim at `path` from the edit target.
    pub fn remove_prim(&self, path: &PrimPath) -> StageResult<()> {
        self.authoring_target()?.remove_prim(path)
    }

    /// Author `value` on `attr_path` at `time` in the edit target.
    pub fn set_attribute(
        &self,
        attr_path: &PrimPath,
        time: TimeCode,
        value: Value,
    ) -> StageResult<()> {
        self.authoring_target()?.set_attribute(attr_path, time, value)
    }

    /// Subscribe to notices. Dropping the token unsubscribes.
    pub fn subscribe(&self) -> SubscriptionToken {
        let (tx, rx) = mpsc::channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, tx));
        SubscriptionToken {
            stage: self.this.clone(),
            id,
            rx,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id);
    }

    fn send(&self, notice: StageNotice) {
        let mut subs = self.subscribers.lock();
        subs.retain(|(_, tx)| tx.send(notice.clone()).is_ok());
    }
}

impl LayerObserver for Stage {
    fn layer_changed(&self, layer: &Arc<Layer>, change: &LayerChange) {
        if !self.has_layer(layer) {
            return;
        }
        if change.sublayers_changed {
            self.rebuild_layer_stack();
        }
        self.send(StageNotice::ObjectsChanged {
            resynced: change.resynced.clone(),
            changed_info_only: change.info_only.clone(),
        });
        self.send(StageNotice::ContentsChanged);
    }
}

/// Handle on a notice subscription; dropping it detaches deterministically.
pub struct SubscriptionToken {
    stage: Weak<Stage>,
    id: u64,
    rx: mpsc::Receiver<StageNotice>,
}

impl std::fmt::Debug for SubscriptionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionToken")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl SubscriptionToken {
    /// Stage this token listens to, if still alive.
    pub fn stage(&self) -> Option<Arc<Stage>> {
        self.stage.upgrade()
    }

    /// Return `true` when the token listens to `stage`.
    pub fn is_for(&self, stage: &Arc<Stage>) -> bool {
        std::ptr::eq(self.stage.as_ptr(), Arc::as_ptr(stage))
    }

    /// Take every pending notice.
    pub fn drain(&self) -> Vec<StageNotice> {
        self.rx.try_iter().collect()
    }
}

impl Drop for SubscriptionToken {
    fn drop(&mut self) {
        if let Some(stage) = self.stage.upgrade() {
            stage.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/stage/composed.rs"]
mod tests;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::foundation::core::{PrimPath, TimeCode};
use crate::foundation::error::{StageError, StageResult};
use crate::foundation::math::{ContentDigest, StableHasher, Vec3};

/// Custom-data key recording the identifiers an unshared wrapper layer references.
pub const REFERENCED_LAYERS_KEY: &str = "referencedLayers";

/// Prefix shared by every anonymous layer identifier.
pub const ANONYMOUS_PREFIX: &str = "anon:";

/// Return `true` when `identifier` names an anonymous (memory-only) layer.
pub fn is_anonymous_identifier(identifier: &str) -> bool {
    identifier.starts_with(ANONYMOUS_PREFIX)
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
/// Authored attribute value.
pub enum Value {
    /// Boolean value.
    Bool(bool),
    /// Scalar value.
    Double(f64),
    /// Token (enumerated string) value.
    Token(String),
    /// 3D vector value.
    Vec3(Vec3),
    /// Point array value.
    Points(Vec<Vec3>),
    /// `[min, max]` extent pair.
    Extent([Vec3; 2]),
}

impl Value {
    /// Scalar payload, if this is a [`Value::Double`].
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Vector payload, if this is a [`Value::Vec3`].
    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            Value::Vec3(v) => Some(*v),
            _ => None,
        }
    }

    /// Token payload, if this is a [`Value::Token`].
    pub fn as_token(&self) -> Option<&str> {
        match self {
            Value::Token(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
/// Attribute opinion: an optional default value plus time samples sorted by time.
pub struct Attribute {
    /// Non time-sampled value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// `(time, value)` samples sorted by time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<(f64, Value)>,
}

impl Attribute {
    /// Return `true` when any value is authored.
    pub fn has_value(&self) -> bool {
        self.default.is_some() || !self.samples.is_empty()
    }

    /// Resolve the value at `time`: held samples first, then the default.
    pub fn value_at(&self, time: TimeCode) -> Option<&Value> {
        let TimeCode::At(t) = time else {
            return self.default.as_ref();
        };
        if self.samples.is_empty() {
            return self.default.as_ref();
        }
        let held = self
            .samples
            .iter()
            .rev()
            .find(|(st, _)| *st <= t)
            .or_else(|| self.samples.first());
        held.map(|(_, v)| v)
    }

    fn set_sample(&mut self, time: f64, value: Value) {
        match self.samples.binary_search_by(|(t, _)| t.total_cmp(&time)) {
            Ok(i) => self.samples[i].1 = value,
            Err(i) => self.samples.insert(i, (time, value)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
/// Prim opinion authored in one layer.
pub struct PrimSpec {
    /// Schema type name; empty for pure overrides.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub type_name: String,
    /// Whether the prim carries a payload arc.
    #[serde(default)]
    pub has_payload: bool,
    /// Authored attributes by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Attribute>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
/// Serializable content of a layer.
pub struct LayerContent {
    /// Ordered sublayer identifiers, strongest first.
    #[serde(default)]
    pub sublayers: Vec<String>,
    /// Frames-per-second metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    /// Timecodes-per-second metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcps: Option<f64>,
    /// Custom string-array metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_data: BTreeMap<String, Vec<String>>,
    /// Prim specs by path.
    #[serde(default)]
    pub prims: BTreeMap<PrimPath, PrimSpec>,
}

impl LayerContent {
    /// Return `true` when the layer carries no opinion and no metadata.
    pub fn is_empty(&self) -> bool {
        *self == LayerContent::default()
    }

    /// Stable xxh3 digest over the content.
    pub fn digest(&self) -> ContentDigest {
        let mut h = StableHasher::new();
        h.write_u64(self.sublayers.len() as u64);
        for s in &self.sublayers {
            h.write_str(s);
        }
        write_opt_f64(&mut h, self.fps);
        write_opt_f64(&mut h, self.tcps);
        h.write_u64(self.custom_data.len() as u64);
        for (k, vs) in &self.custom_data {
            h.write_str(k);
            h.write_u64(vs.len() as u64);
            for v in vs {
                h.write_str(v);
            }
        }
        h.write_u64(self.prims.len() as u64);
        for (path, spec) in &self.prims {
            h.write_str(path.as_str());
            h.write_str(&spec.type_name);
            h.write_u64(u64::from(spec.has_payload));
            h.write_u64(spec.attributes.len() as u64);
            for (name, attr) in &spec.attributes {
                h.write_str(name);
                match &attr.default {
                    Some(v) => {
                        h.write_u64(1);
                        write_value(&mut h, v);
                    }
                    None => h.write_u64(0),
                }
                h.write_u64(attr.samples.len() as u64);
                for (t, v) in &attr.samples {
                    h.write_u64(t.to_bits());
                    write_value(&mut h, v);
                }
            }
        }
        h.finish()
    }
}

fn write_opt_f64(h: &mut StableHasher, v: Option<f64>) {
    match v {
        Some(v) => {
            h.write_u64(1);
            h.write_u64(v.to_bits());
        }
        None => h.write_u64(0),
    }
}

fn write_vec3(h: &mut StableHasher, v: &Vec3) {
    for c in v {
        h.write_u64(c.to_bits());
    }
}

fn write_value(h: &mut StableHasher, v: &Value) {
    match v {
        Value::Bool(b) => {
            h.write_u64(0);
            h.write_u64(u64::from(*b));
        }
        Value::Double(d) => {
            h.write_u64(1);
            h.write_u64(d.to_bits());
        }
        Value::Token(t) => {
            h.write_u64(2);
            h.write_str(t);
        }
        Value::Vec3(p) => {
            h.write_u64(3);
            write_vec3(h, p);
        }
        Value::Points(ps) => {
            h.write_u64(4);
            h.write_u64(ps.len() as u64);
            for p in ps {
                write_vec3(h, p);
            }
        }
        Value::Extent([a, b]) => {
            h.write_u64(5);
            write_vec3(h, a);
            write_vec3(h, b);
        }
    }
}

/// Paths touched by one layer mutation, in the layer's namespace.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LayerChange {
    /// Paths whose topology changed (prims or properties added or removed).
    pub resynced: Vec<PrimPath>,
    /// Paths whose values or metadata changed without topology change.
    pub info_only: Vec<PrimPath>,
    /// Whether the sublayer list changed.
    pub sublayers_changed: bool,
}

/// Receiver of [`LayerChange`]s. Stages observe the layers of their layer stack.
pub trait LayerObserver: Send + Sync {
    /// Called after `layer` was mutated, outside of any layer lock.
    fn layer_changed(&self, layer: &Arc<Layer>, change: &LayerChange);
}

#[derive(Debug)]
struct LayerState {
    content: LayerContent,
    permission_to_edit: bool,
    permission_to_save: bool,
    dirty: bool,
}

/// A layer: an identified, mutable collection of authored opinions.
///
/// Identity is the `Arc` pointer; the identifier is fixed at creation. Anonymous layers get a
/// fresh identifier whenever they are recreated (e.g. after a save/load round trip).
pub struct Layer {
    identifier: String,
    tag: String,
    state: RwLock<LayerState>,
    observers: Mutex<Vec<Weak<dyn LayerObserver>>>,
    this: Weak<Layer>,
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

impl Layer {
    pub(crate) fn new(
        identifier: String,
        tag: String,
        content: LayerContent,
        permission_to_edit: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            identifier,
            tag,
            state: RwLock::new(LayerState {
                content,
                permission_to_edit,
                permission_to_save: true,
                dirty: false,
            }),
            observers: Mutex::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Layer identifier (`anon:<n>:<tag>` or a resolved path).
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Display tag given at creation (for anonymous layers) or the file name.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Return `true` for memory-only layers.
    pub fn is_anonymous(&self) -> bool {
        is_anonymous_identifier(&self.identifier)
    }

    /// Snapshot of the full content.
    pub fn content(&self) -> LayerContent {
        self.state.read().content.clone()
    }

    /// Digest of the current content.
    pub fn digest(&self) -> ContentDigest {
        self.state.read().content.digest()
    }

    /// Return `true` when the layer has no content.
    pub fn is_empty(&self) -> bool {
        self.state.read().content.is_empty()
    }

    /// Ordered sublayer identifiers.
    pub fn sublayers(&self) -> Vec<String> {
        self.state.read().content.sublayers.clone()
    }

    /// Frames-per-second metadata.
    pub fn fps(&self) -> Option<f64> {
        self.state.read().content.fps
    }

    /// Timecodes-per-second metadata.
    pub fn tcps(&self) -> Option<f64> {
        self.state.read().content.tcps
    }

    /// Custom string-array metadata stored under `key` (empty when absent).
    pub fn custom_strings(&self, key: &str) -> Vec<String> {
        self.state
            .read()
            .content
            .custom_data
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Prim spec at `path`, if authored here.
    pub fn prim(&self, path: &PrimPath) -> Option<PrimSpec> {
        self.state.read().content.prims.get(path).cloned()
    }

    /// Run `f` against the content without cloning it.
    pub fn with_content<R>(&self, f: impl FnOnce(&LayerContent) -> R) -> R {
        f(&self.state.read().content)
    }

    /// Whether authoring into this layer is allowed.
    pub fn permission_to_edit(&self) -> bool {
        self.state.read().permission_to_edit
    }

    /// Whether saving this layer is allowed.
    pub fn permission_to_save(&self) -> bool {
        self.state.read().permission_to_save
    }

    /// Set edit permission. Permission flags are not content and produce no change notice.
    pub fn set_permission_to_edit(&self, allow: bool) {
        self.state.write().permission_to_edit = allow;
    }

    /// Set save permission.
    pub fn set_permission_to_save(&self, allow: bool) {
        self.state.write().permission_to_save = allow;
    }

    /// Lock (deny edit and save) or unlock the layer.
    pub fn set_locked(&self, locked: bool) {
        let mut st = self.state.write();
        st.permission_to_edit = !locked;
        st.permission_to_save = !locked;
    }

    /// Return `true` when the layer has unsaved edits.
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    pub(crate) fn mark_clean(&self) {
        self.state.write().dirty = false;
    }

    /// Register an observer. Registering the same observer twice is a no-op.
    pub fn add_observer(&self, observer: Weak<dyn LayerObserver>) {
        let mut obs = self.observers.lock();
        obs.retain(|o| o.strong_count() > 0);
        if !obs.iter().any(|o| Weak::ptr_eq(o, &observer)) {
            obs.push(observer);
        }
    }

    /// Replace the sublayer list.
    pub fn set_sublayers(&self, sublayers: Vec<String>) {
        let changed = {
            let mut st = self.state.write();
            if st.content.sublayers == sublayers {
                false
            } else {
                st.content.sublayers = sublayers;
                st.dirty = true;
                true
            }
        };
        if changed {
            self.notify(LayerChange {
                resynced: vec![PrimPath::absolute_root()],
                sublayers_changed: true,
                ..LayerChange::default()
            });
        }
    }

    /// Set frames-per-second metadata.
    pub fn set_fps(&self, fps: Option<f64>) {
        self.set_metadata(|c| &mut c.fps, fps);
    }

    /// Set timecodes-per-second metadata.
    pub fn set_tcps(&self, tcps: Option<f64>) {
        self.set_metadata(|c| &mut c.tcps, tcps);
    }

    fn set_metadata(
        &self,
        field: impl FnOnce(&mut LayerContent) -> &mut Option<f64>,
        v: Option<f64>,
    ) {
        let changed = {
            let mut guard = self.state.write();
            let st = &mut *guard;
            let slot = field(&mut st.content);
            if *slot == v {
                false
            } else {
                *slot = v;
                st.dirty = true;
                true
            }
        };
        if changed {
            self.notify(LayerChange {
                info_only: vec![PrimPath::absolute_root()],
                ..LayerChange::default()
            });
        }
    }

    /// Store custom string-array metadata under `key`; an empty list removes the key.
    pub fn set_custom_strings(&self, key: &str, values: Vec<String>) {
        let changed = {
            let mut st = self.state.write();
            let current = st.content.custom_data.get(key);
            if current.map(Vec::as_slice).unwrap_or_default() == values.as_slice() {
                false
            } else {
                if values.is_empty() {
                    st.content.custom_data.remove(key);
                } else {
                    st.content.custom_data.insert(key.to_string(), values);
                }
                st.dirty = true;
                true
            }
        };
        if changed {
            self.notify(LayerChange {
                info_only: vec![PrimPath::absolute_root()],
                ..LayerChange::default()
            });
        }
    }

    /// Define (or retype) a prim spec at `path`.
    pub fn define_prim(&self, path: &PrimPath, type_name: &str) -> StageResult<()> {
        require_prim_path(path)?;
        let changed = {
            let mut st = self.state.write();
            let existed = st.content.prims.contains_key(path);
            st.dirty = true;
            let spec = st.content.prims.entry(path.clone()).or_default();
            let retyped = spec.type_name != type_name;
            spec.type_name = type_name.to_string();
            !existed || retyped
        };
        if changed {
            self.notify(LayerChange {
                resynced: vec![path.clone()],
                ..LayerChange::default()
            });
        }
        Ok(())
    }

    /// Mark the prim at `path` as carrying a payload.
    pub fn set_payload(&self, path: &PrimPath, has_payload: bool) -> StageResult<()> {
        require_prim_path(path)?;
        {
            let mut st = self.state.write();
            st.dirty = true;
            st.content.prims.entry(path.clone()).or_default().has_payload = has_payload;
        }
        self.notify(LayerChange {
            resynced: vec![path.clone()],
            ..LayerChange::default()
        });
        Ok(())
    }

    /// Remove the prim spec at `path` and every spec beneath it.
    pub fn remove_prim(&self, path: &PrimPath) -> StageResult<()> {
        require_prim_path(path)?;
        let removed = {
            let mut st = self.state.write();
            let before = st.content.prims.len();
            st.content.prims.retain(|p, _| !p.has_prefix(path));
            let removed = st.content.prims.len() != before;
            st.dirty |= removed;
            removed
        };
        if removed {
            self.notify(LayerChange {
                resynced: vec![path.clone()],
                ..LayerChange::default()
            });
        }
        Ok(())
    }

    /// Author the value of the property at `attr_path` at `time`.
    ///
    /// Creating the attribute is a topology change (resync of the property path); changing an
    /// existing one only changes info.
    pub fn set_attribute(
        &self,
        attr_path: &PrimPath,
        time: TimeCode,
        value: Value,
    ) -> StageResult<()> {
        if !attr_path.is_property_path() {
            return Err(StageError::validation(format!(
                "'{attr_path}' is not a property path"
            )));
        }
        let prim = attr_path.prim_path();
        let name = attr_path.name().to_string();
        let created = {
            let mut st = self.state.write();
            st.dirty = true;
            let spec = st.content.prims.entry(prim).or_default();
            let created = !spec.attributes.contains_key(&name);
            let attr = spec.attributes.entry(name).or_default();
            match time {
                TimeCode::Default => attr.default = Some(value),
                TimeCode::At(t) => attr.set_sample(t, value),
            }
            created
        };
        let mut change = LayerChange::default();
        if created {
            change.resynced.push(attr_path.clone());
        } else {
            change.info_only.push(attr_path.clone());
        }
        self.notify(change);
        Ok(())
    }

    /// Attribute opinion at `attr_path`, if authored here.
    pub fn attribute(&self, attr_path: &PrimPath) -> Option<Attribute> {
        let st = self.state.read();
        st.content
            .prims
            .get(&attr_path.prim_path())
            .and_then(|p| p.attributes.get(attr_path.name()))
            .cloned()
    }

    /// Replace the whole content with `content`.
    pub fn replace_content(&self, content: LayerContent) {
        let changed = {
            let mut st = self.state.write();
            if st.content == content {
                false
            } else {
                st.content = content;
                st.dirty = true;
                true
            }
        };
        if changed {
            self.notify(LayerChange {
                resynced: vec![PrimPath::absolute_root()],
                sublayers_changed: true,
                ..LayerChange::default()
            });
        }
    }

    /// Copy the content of `source` into this layer.
    pub fn transfer_content(&self, source: &Layer) {
        if std::ptr::eq(self, source) {
            return;
        }
        self.replace_content(source.content());
    }

    /// Remove all content.
    pub fn clear(&self) {
        self.replace_content(LayerContent::default());
    }

    fn notify(&self, change: LayerChange) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let observers: Vec<Arc<dyn LayerObserver>> = {
            let mut obs = self.observers.lock();
            obs.retain(|o| o.strong_count() > 0);
            obs.iter().filter_map(Weak::upgrade).collect()
        };
        for o in observers {
            o.layer_changed(&this, &change);
        }
    }
}

fn require_prim_path(path: &PrimPath) -> StageResult<()> {
    if path.is_empty() || path.is_absolute_root() || path.is_property_path() {
        return Err(StageError::validation(format!(
            "'{path}' is not a prim path"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "../../tests/unit/layer/model.rs"]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::layer::model::Layer;
use crate::layer::store::LayerStore;
use crate::stage::composed::Stage;
use crate::stage::load_rules::InitialLoadSet;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
/// Which family of consumers a cached stage belongs to.
pub enum ShareClass {
    /// Stages exposed directly to every consumer asking for the same layers.
    Shared,
    /// Private stages over one consumer's wrapper layers.
    Unshared,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
/// Parameters identifying one composed stage.
pub struct CompositionKey {
    /// Root layer identifier.
    pub root: String,
    /// Session layer identifier.
    pub session: String,
    /// Payload set the stage was opened with.
    pub load_set: InitialLoadSet,
    /// Share class.
    pub share_class: ShareClass,
}

impl CompositionKey {
    fn of(stage: &Stage, share_class: ShareClass) -> Self {
        Self {
            root: stage.root_layer().identifier().to_string(),
            session: stage.session_layer().identifier().to_string(),
            load_set: stage.initial_load_set(),
            share_class,
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
/// Integer handle to a stage registered with [`StageCache::insert`]. `-1` is invalid.
pub struct CacheId(i64);

impl CacheId {
    /// The invalid handle.
    pub const INVALID: CacheId = CacheId(-1);

    /// Wrap a raw host value.
    pub fn from_raw(v: i64) -> Self {
        Self(v)
    }

    /// Raw value for the host.
    pub fn as_raw(self) -> i64 {
        self.0
    }

    /// Return `true` for non-negative handles.
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for CacheId {
    fn default() -> Self {
        Self::INVALID
    }
}

#[derive(Default)]
struct CacheInner {
    entries: Vec<(CompositionKey, Arc<Stage>)>,
    ids: BTreeMap<i64, Arc<Stage>>,
    next_id: i64,
}

/// Stage cache: at most one live stage per [`CompositionKey`].
///
/// Lookup and creation happen under one lock, so concurrent requests for the same key share the
/// stage created by whichever request got there first.
///
/// Entries and id handles hold their stages strongly and are never evicted by the engine. A
/// registered handle may be the only path to a stage (a duplicated consumer finds its copy that
/// way), so the host decides when stages go: call [`StageCache::release_unused`] once consumers
/// are gone, or [`StageCache::erase`] for a single handle.
pub struct StageCache {
    store: Arc<LayerStore>,
    session_tag: String,
    inner: Mutex<CacheInner>,
}

impl std::fmt::Debug for StageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageCache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl StageCache {
    /// Create an empty cache opening stages over `store`.
    pub fn new(store: Arc<LayerStore>) -> Self {
        Self::with_session_tag(store, "session")
    }

    /// Create an empty cache whose implicit session layers are tagged `session_tag`.
    pub fn with_session_tag(store: Arc<LayerStore>, session_tag: impl Into<String>) -> Self {
        Self {
            store,
            session_tag: session_tag.into(),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Layer store stages are opened over.
    pub fn store(&self) -> &Arc<LayerStore> {
        &self.store
    }

    /// Find or compose the stage for `root` and `session`.
    ///
    /// With `session = None` any cached stage over `root` (same load set and class) matches; when
    /// none exists a fresh anonymous session layer is created.
    pub fn open(
        &self,
        root: &Arc<Layer>,
        session: Option<&Arc<Layer>>,
        load_set: InitialLoadSet,
        share_class: ShareClass,
    ) -> Arc<Stage> {
        let mut inner = self.inner.lock();
        let hit = inner.entries.iter().find(|(key, stage)| {
            key.load_set == load_set
                && key.share_class == share_class
                && Arc::ptr_eq(stage.root_layer(), root)
                && session.is_none_or(|s| Arc::ptr_eq(stage.session_layer(), s))
        });
        if let Some((_, stage)) = hit {
            tracing::debug!(root = root.identifier(), ?share_class, "stage cache hit");
            return stage.clone();
        }

        let session = match session {
            Some(s) => s.clone(),
            None => self.store.create_anonymous(&self.session_tag),
        };
        let stage = Stage::open(self.store.clone(), root.clone(), session, load_set);
        inner
            .entries
            .push((CompositionKey::of(&stage, share_class), stage.clone()));
        tracing::debug!(root = root.identifier(), ?share_class, "stage cache miss");
        stage
    }

    /// Return `true` when `stage` is cached under any key.
    pub fn contains(&self, stage: &Arc<Stage>) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .any(|(_, s)| Arc::ptr_eq(s, stage))
    }

    /// Key `stage` is cached under.
    pub fn key_of(&self, stage: &Arc<Stage>) -> Option<CompositionKey> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|(_, s)| Arc::ptr_eq(s, stage))
            .map(|(k, _)| k.clone())
    }

    /// Register `stage` in the handle table; inserting the same stage twice returns the same id.
    pub fn insert(&self, stage: &Arc<Stage>) -> CacheId {
        let mut inner = self.inner.lock();
        if let Some((id, _)) = inner.ids.iter().find(|(_, s)| Arc::ptr_eq(s, stage)) {
            return CacheId(*id);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.ids.insert(id, stage.clone());
        CacheId(id)
    }

    /// Stage registered under `id`.
    pub fn find_by_id(&self, id: CacheId) -> Option<Arc<Stage>> {
        if !id.is_valid() {
            return None;
        }
        self.inner.lock().ids.get(&id.0).cloned()
    }

    /// Return `true` when `id` names a registered stage.
    pub fn contains_id(&self, id: CacheId) -> bool {
        id.is_valid() && self.inner.lock().ids.contains_key(&id.0)
    }

    /// Remove the handle `id`. Returns `true` when it existed.
    pub fn erase(&self, id: CacheId) -> bool {
        self.inner.lock().ids.remove(&id.0).is_some()
    }

    /// Evict every stage referenced by nothing but the cache. Returns the number evicted.
    pub fn release_unused(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut held: BTreeMap<*const Stage, usize> = BTreeMap::new();
        for s in inner
            .entries
            .iter()
            .map(|(_, s)| s)
            .chain(inner.ids.values())
        {
            *held.entry(Arc::as_ptr(s)).or_default() += 1;
        }
        let unused = |s: &Arc<Stage>| {
            Arc::strong_count(s) <= held.get(&Arc::as_ptr(s)).copied().unwrap_or(0)
        };
        let before = inner.entries.len();
        inner.entries.retain(|(_, s)| !unused(s));
        inner.ids.retain(|_, s| !unused(s));
        let evicted = before - inner.entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, "released unused stages");
        }
        evicted
    }

    /// Number of cached stages.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Return `true` when no stage is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "../../tests/unit/stage/cache.rs"]
mod tests;

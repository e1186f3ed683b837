use std::collections::BTreeMap;
use std::sync::Arc;

use crate::layer::model::{Layer, REFERENCED_LAYERS_KEY};
use crate::layer::store::LayerStore;
use crate::layer::sublayers::{remap_sublayers, sublayer_identifiers, sublayer_refs};
use crate::resolve::host::LayerProvider;
use crate::resolve::request::{CompositionRequest, EngineOpts};
use crate::stage::cache::{ShareClass, StageCache};
use crate::stage::composed::Stage;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
/// Whether a consumer exposes the shared stage or its private wrapper stage.
pub enum ShareMode {
    /// Before the first resolution.
    #[default]
    Unknown,
    /// The resolved stage is exposed directly.
    Shared,
    /// A private stage over the consumer's wrapper root is exposed.
    Unshared,
}

impl ShareMode {
    /// Mode a request for sharing maps to.
    pub fn requested(share: bool) -> Self {
        if share { Self::Shared } else { Self::Unshared }
    }
}

/// Per-consumer share state: the current mode, the unshared wrapper (root and private session
/// layer, kept for the consumer's lifetime once created) and the sublayers retained from it
/// while shared.
#[derive(Default)]
pub struct ShareModeController {
    mode: ShareMode,
    wrapper_root: Option<Arc<Layer>>,
    wrapper_session: Option<Arc<Layer>>,
    retained_sublayers: Vec<Arc<Layer>>,
    session_recovered: bool,
}

impl std::fmt::Debug for ShareModeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareModeController")
            .field("mode", &self.mode)
            .field("wrapper_root", &self.wrapper_root.as_ref().map(|l| l.identifier()))
            .field(
                "wrapper_session",
                &self.wrapper_session.as_ref().map(|l| l.identifier()),
            )
            .field("retained_sublayers", &self.retained_sublayers.len())
            .field("session_recovered", &self.session_recovered)
            .finish()
    }
}

impl ShareModeController {
    /// Create a controller in [`ShareMode::Unknown`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode recorded by the last transition.
    pub fn mode(&self) -> ShareMode {
        self.mode
    }

    /// The unshared wrapper root, when one was built.
    pub fn wrapper_root(&self) -> Option<&Arc<Layer>> {
        self.wrapper_root.as_ref()
    }

    /// The wrapper's private session layer.
    pub fn wrapper_session(&self) -> Option<&Arc<Layer>> {
        self.wrapper_session.as_ref()
    }

    /// Sublayers of the wrapper snapshotted during the last shared resolution.
    pub fn retained_sublayers(&self) -> &[Arc<Layer>] {
        &self.retained_sublayers
    }

    /// Stage the consumer exposes for `resolved`.
    ///
    /// Shared requests expose `resolved` as is. Unshared requests expose a private stage over the
    /// wrapper root, whose sublayers follow the identifier of `resolved`'s root layer.
    #[tracing::instrument(skip_all, fields(share = req.share_requested))]
    pub fn apply(
        &mut self,
        cache: &StageCache,
        resolved: &Arc<Stage>,
        req: &CompositionRequest,
        provider: &dyn LayerProvider,
        opts: &EngineOpts,
    ) -> Arc<Stage> {
        if req.share_requested {
            if let Some(wrapper) = &self.wrapper_root {
                let closure = sublayer_refs(cache.store(), std::slice::from_ref(wrapper));
                self.retained_sublayers = closure
                    .into_iter()
                    .filter(|l| !Arc::ptr_eq(l, wrapper))
                    .collect();
            }
            return resolved.clone();
        }

        if self.wrapper_root.is_none() {
            self.recover_wrapper(req, provider);
        }
        let wrapper = self.update_wrapper(cache.store(), resolved.root_layer(), opts);
        let store = cache.store();
        let session = self
            .wrapper_session
            .get_or_insert_with(|| store.create_anonymous(&opts.session_tag))
            .clone();
        let stage = cache.open(
            &wrapper,
            Some(&session),
            opts.initial_load_set,
            ShareClass::Unshared,
        );
        reproduce_shared_state(resolved, &stage);
        stage
    }

    fn recover_wrapper(&mut self, req: &CompositionRequest, provider: &dyn LayerProvider) {
        if self.wrapper_session.is_none() {
            self.wrapper_session = provider.compute_session_layer(&req.session_layer_name);
            self.session_recovered = self.wrapper_session.is_some();
        }
        let Some(root) = provider.compute_root_layer(&req.root_layer_name) else {
            return;
        };
        let referenced: Vec<String> = root
            .custom_strings(REFERENCED_LAYERS_KEY)
            .into_iter()
            .map(|id| match provider.find_persisted(&id) {
                Some(layer) => layer.identifier().to_string(),
                None => id,
            })
            .collect();
        root.set_custom_strings(REFERENCED_LAYERS_KEY, referenced);
        tracing::debug!(root = root.identifier(), "recovered unshared wrapper");
        self.wrapper_root = Some(root);
    }

    fn update_wrapper(
        &mut self,
        store: &LayerStore,
        incoming_root: &Arc<Layer>,
        opts: &EngineOpts,
    ) -> Arc<Layer> {
        let incoming_id = incoming_root.identifier().to_string();
        if let Some(wrapper) = &self.wrapper_root {
            let referenced = wrapper.custom_strings(REFERENCED_LAYERS_KEY);
            if referenced.first() != Some(&incoming_id) {
                if let Some(old) = referenced.first() {
                    let rename = BTreeMap::from([(old.clone(), incoming_id.clone())]);
                    remap_sublayers(store, wrapper, &rename);
                }
                let closure = sublayer_identifiers(store, std::slice::from_ref(wrapper));
                if !closure.contains(&incoming_id) {
                    let mut subs = wrapper.sublayers();
                    subs.push(incoming_id.clone());
                    wrapper.set_sublayers(subs);
                }
                wrapper.set_custom_strings(REFERENCED_LAYERS_KEY, vec![incoming_id.clone()]);
                tracing::debug!(
                    wrapper = wrapper.identifier(),
                    incoming = %incoming_id,
                    "wrapper follows new incoming root"
                );
            }
            return wrapper.clone();
        }

        let wrapper = store.create_anonymous(&opts.unshared_root_tag);
        wrapper.set_custom_strings(REFERENCED_LAYERS_KEY, vec![incoming_id.clone()]);
        wrapper.set_sublayers(vec![incoming_id]);
        tracing::debug!(wrapper = wrapper.identifier(), "created unshared wrapper");
        self.wrapper_root = Some(wrapper.clone());
        wrapper
    }

    /// Record `new_mode`, moving session content into the session layer about to become active.
    ///
    /// The first resolution moves nothing when shared, nor when unshared with a recovered
    /// wrapper session; the content is already in place. An edit target on the vacated session
    /// layer is repointed; without a `cached_target` the shared stage's live target is checked.
    /// Returns `true` when content moved.
    pub fn update_share_mode(
        &mut self,
        store: &LayerStore,
        shared: &Stage,
        new_mode: ShareMode,
        session_tag: &str,
        cached_target: &mut Option<Arc<Layer>>,
    ) -> bool {
        let previous = self.mode;
        if previous == new_mode {
            return false;
        }
        self.mode = new_mode;
        if previous == ShareMode::Unknown
            && (new_mode != ShareMode::Unshared || self.session_recovered)
        {
            return false;
        }

        let shared_session = shared.session_layer();
        let unshared_session = self
            .wrapper_session
            .get_or_insert_with(|| store.create_anonymous(session_tag))
            .clone();
        let (from, to) = match new_mode {
            ShareMode::Shared => (&unshared_session, shared_session),
            _ => (shared_session, &unshared_session),
        };
        to.transfer_content(from);
        let live = cached_target.clone().unwrap_or_else(|| shared.edit_target());
        if Arc::ptr_eq(&live, from) {
            *cached_target = Some(to.clone());
        }
        tracing::debug!(
            ?previous,
            ?new_mode,
            from = from.identifier(),
            to = to.identifier(),
            "transferred session layer"
        );
        true
    }
}

fn reproduce_shared_state(shared: &Stage, unshared: &Stage) {
    let shared_root = shared.root_layer();
    let unshared_root = unshared.root_layer();
    if let Some(fps) = shared_root.fps() {
        unshared_root.set_fps(Some(fps));
        unshared.set_frames_per_second(fps);
    }
    if let Some(tcps) = shared_root.tcps() {
        unshared_root.set_tcps(Some(tcps));
        unshared.set_time_codes_per_second(tcps);
    }
}

#[cfg(test)]
#[path = "../../tests/unit/share/controller.rs"]
mod tests;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::foundation::core::{PrimPath, TimeCode};
use crate::foundation::error::{StageError, StageResult};
use crate::foundation::math::Box3d;
use crate::layer::model::Layer;
use crate::layer::sublayers::sublayer_identifiers;
use crate::notify::bounds::{NoPulledBounds, PulledBounds, PurposeMask};
use crate::notify::notifier::{ChangeNotifier, NotifyReport};
use crate::overrides::sets::OverrideSets;
use crate::overrides::sync::{OverrideSyncEngine, SyncInputs, SyncReport};
use crate::resolve::host::{
    DefaultHost, HostContext, HostOutputs, HostSnapshot, LayerProvider, NoLayerProvider,
};
use crate::resolve::request::{CompositionRequest, EngineOpts, IncomingStage};
use crate::resolve::resolver::StageResolver;
use crate::share::controller::{ShareMode, ShareModeController};
use crate::stage::cache::StageCache;
use crate::stage::composed::Stage;
use crate::stage::load_rules::LoadRules;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Evaluation context of a compute request.
pub enum EvalContext {
    /// The context that owns resolution.
    Normal,
    /// Secondary contexts; they reuse the normal-context result.
    Background,
}

#[derive(Clone, Debug)]
/// A stage as exposed by a consumer.
pub struct ExposedStage {
    /// The exposed stage.
    pub stage: Arc<Stage>,
    /// Prim path exposed within it.
    pub prim_path: PrimPath,
}

#[derive(Clone)]
/// Collaborators shared by every consumer of one host.
pub struct EngineServices {
    /// Process-wide stage cache.
    pub cache: Arc<StageCache>,
    /// Host callbacks.
    pub host: Arc<dyn HostContext>,
    /// Storage of consumers' own layers.
    pub provider: Arc<dyn LayerProvider>,
    /// Engine options.
    pub opts: EngineOpts,
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("cache", &self.cache)
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl EngineServices {
    /// Services over `cache` with a [`DefaultHost`], no layer storage and default options.
    pub fn new(cache: Arc<StageCache>) -> Self {
        Self {
            cache,
            host: Arc::new(DefaultHost::new()),
            provider: Arc::new(NoLayerProvider),
            opts: EngineOpts::default(),
        }
    }

    /// Replace the host.
    pub fn with_host(mut self, host: Arc<dyn HostContext>) -> Self {
        self.host = host;
        self
    }

    /// Replace the layer provider.
    pub fn with_provider(mut self, provider: Arc<dyn LayerProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Replace the options.
    pub fn with_opts(mut self, opts: EngineOpts) -> Self {
        self.opts = opts;
        self
    }
}

/// One consumer of a stage: resolves it from host inputs, exposes it shared or unshared, keeps
/// the persisted overrides in sync and listens to its changes.
pub struct StageConsumer {
    services: EngineServices,
    snapshot: HostSnapshot,
    overrides: OverrideSets,
    resolver: StageResolver,
    share: ShareModeController,
    sync: OverrideSyncEngine,
    cached_target: Option<Arc<Layer>>,
    incoming_layers: BTreeSet<String>,
    stage_incoming: bool,
    shared_stage: Option<Arc<Stage>>,
    exposed: Option<ExposedStage>,
    notifier: ChangeNotifier,
    outputs: HostOutputs,
    stage_version: u64,
    purpose_mask: PurposeMask,
    pulled: Arc<dyn PulledBounds>,
    last_sync: SyncReport,
}

impl std::fmt::Debug for StageConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageConsumer")
            .field("snapshot", &self.snapshot)
            .field("overrides", &self.overrides)
            .field("share", &self.share)
            .field("stage_version", &self.stage_version)
            .finish_non_exhaustive()
    }
}

impl StageConsumer {
    /// Create a consumer computing from `snapshot`.
    pub fn new(services: EngineServices, snapshot: HostSnapshot) -> Self {
        let resolver = StageResolver::new(
            services.cache.clone(),
            services.host.clone(),
            services.provider.clone(),
            services.opts.clone(),
        );
        Self {
            overrides: snapshot.overrides(),
            services,
            snapshot,
            resolver,
            share: ShareModeController::new(),
            sync: OverrideSyncEngine::new(),
            cached_target: None,
            incoming_layers: BTreeSet::new(),
            stage_incoming: false,
            shared_stage: None,
            exposed: None,
            notifier: ChangeNotifier::new(),
            outputs: HostOutputs::default(),
            stage_version: 0,
            purpose_mask: PurposeMask::default(),
            pulled: Arc::new(NoPulledBounds),
            last_sync: SyncReport::default(),
        }
    }

    /// Resolve and expose the stage.
    ///
    /// The normal context detaches from the previous stage, resolves, applies the share mode,
    /// synchronizes overrides and attaches to the result. On failure the previous stage stays
    /// exposed. The background context only returns the normal-context result.
    #[tracing::instrument(skip_all, fields(ctx = ?ctx))]
    pub fn compute(
        &mut self,
        ctx: EvalContext,
        incoming: Option<IncomingStage>,
    ) -> StageResult<ExposedStage> {
        if ctx == EvalContext::Background {
            return self.exposed.clone().ok_or_else(|| {
                StageError::resolution("no stage resolved in the normal context yet")
            });
        }

        self.notifier.detach();
        let req = CompositionRequest::from_snapshot(&self.snapshot, incoming);
        let resolved = match self.resolver.resolve(&req) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(error = %e, "resolution failed, keeping the previous stage");
                if let Some(previous) = &self.exposed {
                    self.notifier.attach(&previous.stage, previous.prim_path.clone());
                }
                return Err(e);
            }
        };

        if let Some(file_path) = &resolved.file_path {
            tracing::debug!(file_path = %file_path, "writing back file path");
            self.snapshot.file_path = file_path.clone();
            self.outputs.file_path = Some(file_path.clone());
        }
        let cache = self.services.cache.clone();
        self.stage_incoming = resolved.is_incoming;
        self.incoming_layers = if resolved.is_incoming {
            sublayer_identifiers(
                cache.store(),
                std::slice::from_ref(resolved.stage.root_layer()),
            )
        } else {
            BTreeSet::new()
        };

        let final_stage = self.share.apply(
            &cache,
            &resolved.stage,
            &req,
            self.services.provider.as_ref(),
            &self.services.opts,
        );

        // A cached target from an unrelated stage does not survive.
        if let Some(target) = &self.cached_target
            && !final_stage.has_layer(target)
            && !resolved.stage.has_layer(target)
        {
            self.cached_target = None;
        }
        let name_map = self.services.provider.name_map();
        let inputs = SyncInputs {
            overrides: &self.overrides,
            load_payloads: req.load_payloads,
            name_map: &name_map,
        };
        let new_mode = ShareMode::requested(req.share_requested);
        let share = &mut self.share;
        let session_tag = self.services.opts.session_tag.as_str();
        self.last_sync = self.sync.sync(&final_stage, inputs, &mut self.cached_target, |target| {
            share.update_share_mode(cache.store(), &resolved.stage, new_mode, session_tag, target);
        });

        let changed = self
            .exposed
            .as_ref()
            .is_none_or(|e| !Arc::ptr_eq(&e.stage, &final_stage));
        if changed {
            self.stage_version += 1;
            self.services.host.invalidate_view();
        }
        self.notifier.attach(&final_stage, resolved.prim_path.clone());
        self.outputs.out_stage = Some(final_stage.clone());
        self.outputs.out_time = self.snapshot.time;
        self.outputs.out_stage_cache_id = cache.insert(&final_stage);
        self.outputs.update_counter = self.notifier.update_counter();
        self.outputs.resync_counter = self.notifier.resync_counter();
        self.shared_stage = Some(resolved.stage);

        let exposed = ExposedStage {
            stage: final_stage,
            prim_path: resolved.prim_path,
        };
        self.exposed = Some(exposed.clone());
        Ok(exposed)
    }

    /// Handle pending change notices of the exposed stage.
    ///
    /// Counters flow into the outputs, a new edit target is cached, muting changes are written
    /// back into the overrides and structural changes invalidate dependent views.
    pub fn process_notices(&mut self) -> NotifyReport {
        let report = self.notifier.process();
        self.outputs.update_counter = self.notifier.update_counter();
        self.outputs.resync_counter = self.notifier.resync_counter();
        if let Some(target) = &report.edit_target {
            self.cached_target = Some(target.clone());
        }
        if report.muting_changed
            && let Some(exposed) = &self.exposed
            && self
                .sync
                .reverse_sync_mutes(&exposed.stage, &mut self.overrides)
        {
            self.snapshot.record_overrides(&self.overrides);
        }
        if report.resyncs > 0 || report.view_dirty {
            self.services.host.invalidate_view();
        }
        report
    }

    /// Bound of the exposed prim subtree at `time`.
    pub fn compute_bounds(&mut self, time: TimeCode) -> Box3d {
        self.notifier.compute_bounds(time, self.purpose_mask, self.pulled.as_ref())
    }

    /// Mute `identifier` on the exposed stage and in the overrides.
    pub fn mute_layer(&mut self, identifier: &str) {
        if let Some(exposed) = &self.exposed {
            exposed.stage.mute_layer(identifier);
        }
        if self.overrides.mute(identifier) {
            self.snapshot.record_overrides(&self.overrides);
        }
    }

    /// Unmute `identifier` on the exposed stage and in the overrides.
    pub fn unmute_layer(&mut self, identifier: &str) {
        if let Some(exposed) = &self.exposed {
            exposed.stage.unmute_layer(identifier);
        }
        if self.overrides.unmute(identifier) {
            self.snapshot.record_overrides(&self.overrides);
        }
    }

    fn live_layer(&self, identifier: &str) -> StageResult<Arc<Layer>> {
        let stage = self
            .exposed
            .as_ref()
            .map(|e| &e.stage)
            .ok_or_else(|| StageError::resolution("no stage exposed"))?;
        stage
            .layer_by_identifier(identifier)
            .or_else(|| stage.store().find(identifier))
            .ok_or_else(|| StageError::stale_reference(format!("layer '{identifier}'")))
    }

    /// Lock `identifier` and record the lock.
    pub fn lock_layer(&mut self, identifier: &str) -> StageResult<()> {
        self.live_layer(identifier)?.set_locked(true);
        if self.overrides.lock(identifier) {
            self.snapshot.record_overrides(&self.overrides);
        }
        Ok(())
    }

    /// Unlock `identifier` and forget the lock.
    pub fn unlock_layer(&mut self, identifier: &str) -> StageResult<()> {
        self.live_layer(identifier)?.set_locked(false);
        if self.overrides.unlock(identifier) {
            self.snapshot.record_overrides(&self.overrides);
        }
        Ok(())
    }

    /// Move the edit target of the exposed stage to `identifier` and record it.
    pub fn set_edit_target(&mut self, identifier: &str) -> StageResult<()> {
        let stage = self
            .exposed
            .as_ref()
            .map(|e| e.stage.clone())
            .ok_or_else(|| StageError::resolution("no stage exposed"))?;
        let layer = stage.layer_by_identifier(identifier).ok_or_else(|| {
            StageError::validation(format!("layer '{identifier}' is not in the layer stack"))
        })?;
        stage.set_edit_target(&layer)?;
        self.cached_target = Some(layer);
        self.overrides.edit_target = Some(identifier.to_string());
        self.snapshot.record_overrides(&self.overrides);
        Ok(())
    }

    /// Replace every input; the overrides are reloaded from `snapshot`.
    pub fn set_inputs(&mut self, snapshot: HostSnapshot) {
        self.overrides = snapshot.overrides();
        self.snapshot = snapshot;
    }

    /// Set the share toggle.
    pub fn set_share_stage(&mut self, share: bool) {
        self.snapshot.share_stage = share;
    }

    /// Set the payload policy flag.
    pub fn set_load_payloads(&mut self, load: bool) {
        self.snapshot.load_payloads = load;
    }

    /// Set the root layer path.
    pub fn set_file_path(&mut self, path: impl Into<String>) {
        self.snapshot.file_path = path.into();
    }

    /// Set the exposed prim path.
    pub fn set_prim_path(&mut self, path: impl Into<String>) {
        self.snapshot.prim_path = path.into();
    }

    /// Set the stage cache handle.
    pub fn set_stage_cache_id(&mut self, id: i32) {
        self.snapshot.stage_cache_id = id;
    }

    /// Set the evaluation time.
    pub fn set_time(&mut self, time: f64) {
        self.snapshot.time = time;
    }

    /// Record explicit load rules; `None` falls back to the payload policy flag.
    pub fn set_load_rules(&mut self, rules: Option<LoadRules>) {
        self.overrides.load_rules = rules;
        self.snapshot.record_overrides(&self.overrides);
    }

    /// Capture the exposed stage's current load rules as the explicit rules.
    pub fn record_stage_load_rules(&mut self) {
        if let Some(exposed) = &self.exposed {
            self.overrides.load_rules = Some(exposed.stage.load_rules());
            self.snapshot.record_overrides(&self.overrides);
        }
    }

    /// Set the purpose mask bounds are computed with.
    pub fn set_purpose_mask(&mut self, mask: PurposeMask) {
        self.purpose_mask = mask;
    }

    /// Set the provider of pulled bounds.
    pub fn set_pulled_bounds(&mut self, pulled: Arc<dyn PulledBounds>) {
        self.pulled = pulled;
    }

    /// The services.
    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    /// Current inputs.
    pub fn snapshot(&self) -> &HostSnapshot {
        &self.snapshot
    }

    /// Current overrides.
    pub fn overrides(&self) -> &OverrideSets {
        &self.overrides
    }

    /// Outputs of the last compute.
    pub fn outputs(&self) -> &HostOutputs {
        &self.outputs
    }

    /// Exposed stage.
    pub fn stage(&self) -> Option<&Arc<Stage>> {
        self.exposed.as_ref().map(|e| &e.stage)
    }

    /// Exposed prim path.
    pub fn prim_path(&self) -> Option<&PrimPath> {
        self.exposed.as_ref().map(|e| &e.prim_path)
    }

    /// The resolved stage before the share mode was applied.
    pub fn shared_stage(&self) -> Option<&Arc<Stage>> {
        self.shared_stage.as_ref()
    }

    /// Current share mode.
    pub fn share_mode(&self) -> ShareMode {
        self.share.mode()
    }

    /// The share controller.
    pub fn share(&self) -> &ShareModeController {
        &self.share
    }

    /// The resolver.
    pub fn resolver(&self) -> &StageResolver {
        &self.resolver
    }

    /// Edit target carried across resolutions.
    pub fn cached_edit_target(&self) -> Option<&Arc<Layer>> {
        self.cached_target.as_ref()
    }

    /// The change notifier.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// What the last synchronization changed.
    pub fn last_sync(&self) -> &SyncReport {
        &self.last_sync
    }

    /// Incremented whenever a different stage gets exposed.
    pub fn stage_version(&self) -> u64 {
        self.stage_version
    }

    /// Prim paths hidden from dependent views.
    pub fn excluded_prim_paths(&self) -> Vec<PrimPath> {
        self.snapshot.excluded_prim_paths()
    }

    /// Whether `identifier` belongs to the layers of an incoming stage.
    pub fn is_incoming_layer(&self, identifier: &str) -> bool {
        self.incoming_layers.contains(identifier)
    }

    /// Whether the exposed stage was handed over rather than opened by this consumer.
    pub fn is_stage_incoming(&self) -> bool {
        self.stage_incoming
    }

    pub(crate) fn seed(
        &mut self,
        cached_target: Option<Arc<Layer>>,
        anonymous_root: Option<Arc<Layer>>,
    ) {
        self.cached_target = cached_target;
        self.resolver.set_anonymous_root(anonymous_root);
    }
}

#[cfg(test)]
#[path = "../../tests/unit/session/consumer.rs"]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::foundation::core::PrimPath;
use crate::foundation::error::StageError;
use crate::layer::model::Layer;
use crate::overrides::sets::OverrideSets;
use crate::stage::composed::Stage;

#[derive(Clone, Debug, Default, PartialEq)]
/// Mutations performed by one [`OverrideSyncEngine::sync`].
pub struct SyncReport {
    /// Layers whose lock was applied.
    pub locks_applied: Vec<String>,
    /// Whether the edit target moved.
    pub edit_target_changed: bool,
    /// Layers newly muted.
    pub layers_muted: Vec<String>,
    /// Whether the load rules changed.
    pub load_rules_changed: bool,
    /// Override identifiers that resolve to no live layer; skipped and kept for later.
    pub stale: Vec<String>,
}

impl SyncReport {
    /// Return `true` when the stage was not mutated.
    pub fn is_noop(&self) -> bool {
        self.locks_applied.is_empty()
            && !self.edit_target_changed
            && self.layers_muted.is_empty()
            && !self.load_rules_changed
    }

    fn stale(&mut self, identifier: &str, what: &str) {
        let e = StageError::stale_reference(format!("{what} layer '{identifier}'"));
        tracing::warn!(error = %e, "skipping override");
        self.stale.push(identifier.to_string());
    }
}

#[derive(Clone, Copy, Debug)]
/// Inputs of one forward synchronization.
pub struct SyncInputs<'a> {
    /// Persisted overrides.
    pub overrides: &'a OverrideSets,
    /// Load-payloads flag used when `overrides` has no explicit rules.
    pub load_payloads: bool,
    /// Persisted identifier to current identifier, for layers reloaded under a new identifier.
    pub name_map: &'a BTreeMap<String, String>,
}

impl SyncInputs<'_> {
    fn current_id<'s>(&'s self, identifier: &'s str) -> &'s str {
        self.name_map
            .get(identifier)
            .map(String::as_str)
            .unwrap_or(identifier)
    }
}

struct ReverseSyncGuard<'a>(&'a AtomicBool);

impl Drop for ReverseSyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Applies [`OverrideSets`] onto a stage in a fixed order: locks, edit target derivation, the
/// caller's share-mode transition, edit target application, mutes, load rules.
///
/// Every step only mutates what differs, so a second sync with unchanged inputs is a no-op.
#[derive(Debug, Default)]
pub struct OverrideSyncEngine {
    reverse_active: AtomicBool,
}

impl OverrideSyncEngine {
    /// Create an engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronize `inputs` onto `stage`.
    ///
    /// `cached_target` is the consumer's edit target carried across resolutions; it is derived
    /// from the persisted edit target when empty. `transition` runs between edit target
    /// derivation and application and may repoint `cached_target`.
    #[tracing::instrument(skip_all, fields(root = stage.root_layer().identifier()))]
    pub fn sync(
        &self,
        stage: &Arc<Stage>,
        inputs: SyncInputs<'_>,
        cached_target: &mut Option<Arc<Layer>>,
        transition: impl FnOnce(&mut Option<Arc<Layer>>),
    ) -> SyncReport {
        let mut report = SyncReport::default();
        if self.is_reverse_syncing() {
            tracing::debug!("reverse mute sync in progress, skipping forward sync");
            return report;
        }
        self.apply_locks(stage, &inputs, &mut report);
        let derived = self.derive_edit_target(stage, &inputs, cached_target, &mut report);
        transition(cached_target);
        self.apply_edit_target(stage, cached_target.as_ref(), derived, &mut report);
        self.apply_mutes(stage, &inputs, &mut report);
        self.apply_load_rules(stage, &inputs, &mut report);
        if !report.is_noop() {
            tracing::debug!(?report, "synchronized overrides");
        }
        report
    }

    fn find_layer(stage: &Stage, identifier: &str) -> Option<Arc<Layer>> {
        stage
            .layer_by_identifier(identifier)
            .or_else(|| stage.store().find(identifier))
    }

    fn apply_locks(&self, stage: &Stage, inputs: &SyncInputs<'_>, report: &mut SyncReport) {
        for id in &inputs.overrides.locked_layers {
            let current = inputs.current_id(id);
            let Some(layer) = Self::find_layer(stage, current) else {
                report.stale(id, "locked");
                continue;
            };
            if layer.permission_to_edit() || layer.permission_to_save() {
                layer.set_locked(true);
                report.locks_applied.push(current.to_string());
            }
        }
    }

    fn derive_edit_target(
        &self,
        stage: &Stage,
        inputs: &SyncInputs<'_>,
        cached_target: &mut Option<Arc<Layer>>,
        report: &mut SyncReport,
    ) -> Option<Arc<Layer>> {
        if cached_target.is_some() {
            return None;
        }
        let id = inputs.overrides.edit_target.as_deref()?;
        let current = inputs.current_id(id);
        match stage.layer_by_identifier(current) {
            Some(layer) => {
                *cached_target = Some(layer.clone());
                Some(layer)
            }
            None => {
                report.stale(id, "edit target");
                None
            }
        }
    }

    fn apply_edit_target(
        &self,
        stage: &Stage,
        cached_target: Option<&Arc<Layer>>,
        derived: Option<Arc<Layer>>,
        report: &mut SyncReport,
    ) {
        let mut target = derived;
        if let Some(cached) = cached_target
            && stage.has_layer(cached)
            && !target.as_ref().is_some_and(|d| Arc::ptr_eq(d, cached))
        {
            target = Some(cached.clone());
        }
        let Some(target) = target else {
            return;
        };
        if Arc::ptr_eq(&stage.edit_target(), &target) {
            return;
        }
        match stage.set_edit_target(&target) {
            Ok(()) => report.edit_target_changed = true,
            Err(e) => tracing::warn!(error = %e, "edit target not applied"),
        }
    }

    fn apply_mutes(&self, stage: &Stage, inputs: &SyncInputs<'_>, report: &mut SyncReport) {
        let mut to_mute = Vec::new();
        for id in &inputs.overrides.muted_layers {
            let current = inputs.current_id(id);
            if stage.is_layer_muted(current)
                || current == stage.root_layer().identifier()
                || current == stage.session_layer().identifier()
            {
                continue;
            }
            if stage.store().find(current).is_none() {
                report.stale(id, "muted");
                continue;
            }
            to_mute.push(current.to_string());
        }
        if to_mute.is_empty() {
            return;
        }
        stage.mute_and_unmute_layers(&to_mute, &[]);
        report.layers_muted = to_mute;
    }

    fn apply_load_rules(&self, stage: &Stage, inputs: &SyncInputs<'_>, report: &mut SyncReport) {
        let rules = match &inputs.overrides.load_rules {
            Some(explicit) => explicit.clone(),
            None => {
                let mut rules = stage.load_rules();
                let root = PrimPath::absolute_root();
                if inputs.load_payloads {
                    rules.load_with_descendants(&root);
                } else {
                    rules.unload(&root);
                }
                rules
            }
        };
        report.load_rules_changed = stage.set_load_rules(rules);
    }

    /// Write the stage's muted layers back into `overrides`.
    ///
    /// While this runs, [`OverrideSyncEngine::sync`] is a no-op. Returns `true` when the
    /// persisted set changed; a nested call returns `false` without touching anything.
    pub fn reverse_sync_mutes(&self, stage: &Stage, overrides: &mut OverrideSets) -> bool {
        if self.reverse_active.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _guard = ReverseSyncGuard(&self.reverse_active);
        let changed = overrides.set_muted_layers(stage.muted_layers());
        if changed {
            tracing::debug!(muted = ?overrides.muted_layers, "recorded stage mutes");
        }
        changed
    }

    /// Return `true` while a reverse mute sync runs.
    pub fn is_reverse_syncing(&self) -> bool {
        self.reverse_active.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn hold_reverse_sync(&self) -> ReverseSyncGuard<'_> {
        self.reverse_active.store(true, Ordering::Release);
        ReverseSyncGuard(&self.reverse_active)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/overrides/sync.rs"]
mod tests;

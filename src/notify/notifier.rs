use std::sync::Arc;

use crate::foundation::core::{PrimPath, TimeCode};
use crate::foundation::error::StageError;
use crate::foundation::math::Box3d;
use crate::layer::model::Layer;
use crate::notify::bounds::{BoundingBoxCache, PulledBounds, PurposeMask, compute_world_bound};
use crate::notify::classify::{ChangeKind, affects_bounds, classify};
use crate::notify::extent::repair_extents;
use crate::stage::composed::{Stage, SubscriptionToken};
use crate::stage::notice::StageNotice;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Whether a [`ChangeNotifier`] currently listens to a stage.
pub enum NotifierState {
    /// Not listening.
    Detached,
    /// Listening to exactly one stage.
    Attached,
}

#[derive(Debug, Default)]
/// What one [`ChangeNotifier::process`] call observed.
pub struct NotifyReport {
    /// Objects-changed notices classified as updates (resyncs included).
    pub updates: u32,
    /// Objects-changed notices classified as resyncs.
    pub resyncs: u32,
    /// New edit target, when the stage reported one.
    pub edit_target: Option<Arc<Layer>>,
    /// Whether the set of muted layers changed.
    pub muting_changed: bool,
    /// Whether any layer content changed and dependent views need a redraw.
    pub view_dirty: bool,
    /// Prims whose authored extent was rewritten.
    pub extents_repaired: Vec<PrimPath>,
    /// Animated extents left stale.
    pub conflicts: Vec<StageError>,
}

impl NotifyReport {
    /// Return `true` when nothing was observed.
    pub fn is_empty(&self) -> bool {
        self.updates == 0
            && self.edit_target.is_none()
            && !self.muting_changed
            && !self.view_dirty
            && self.extents_repaired.is_empty()
            && self.conflicts.is_empty()
    }
}

/// Per-consumer listener on the exposed stage.
///
/// Classifies objects-changed notices against the observed prim subtree, keeps the update and
/// resync counters, owns the [`BoundingBoxCache`] and repairs stale authored extents.
#[derive(Debug)]
pub struct ChangeNotifier {
    token: Option<SubscriptionToken>,
    observed: PrimPath,
    bounds: BoundingBoxCache,
    update_counter: i64,
    resync_counter: i64,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    /// Create a detached notifier.
    pub fn new() -> Self {
        Self {
            token: None,
            observed: PrimPath::empty(),
            bounds: BoundingBoxCache::new(),
            update_counter: 0,
            resync_counter: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> NotifierState {
        if self.token.is_some() {
            NotifierState::Attached
        } else {
            NotifierState::Detached
        }
    }

    /// Start listening to `stage`, observing `observed` and beneath.
    ///
    /// Any previous subscription is dropped first.
    pub fn attach(&mut self, stage: &Arc<Stage>, observed: PrimPath) {
        self.detach();
        self.token = Some(stage.subscribe());
        tracing::debug!(root = stage.root_layer().identifier(), observed = %observed, "attached");
        self.observed = observed;
    }

    /// Stop listening and drop cached bounds.
    pub fn detach(&mut self) {
        if self.token.take().is_some() {
            tracing::debug!("detached");
        }
        self.bounds.clear();
    }

    /// Return `true` when attached to `stage`.
    pub fn is_attached_to(&self, stage: &Arc<Stage>) -> bool {
        self.token.as_ref().is_some_and(|t| t.is_for(stage))
    }

    /// Stage listened to.
    pub fn stage(&self) -> Option<Arc<Stage>> {
        self.token.as_ref().and_then(SubscriptionToken::stage)
    }

    /// Observed prim path.
    pub fn observed(&self) -> &PrimPath {
        &self.observed
    }

    /// Number of update notices seen, resyncs included.
    pub fn update_counter(&self) -> i64 {
        self.update_counter
    }

    /// Number of resync notices seen.
    pub fn resync_counter(&self) -> i64 {
        self.resync_counter
    }

    /// The bounds cache.
    pub fn bounds(&self) -> &BoundingBoxCache {
        &self.bounds
    }

    /// Handle every pending notice.
    pub fn process(&mut self) -> NotifyReport {
        let mut report = NotifyReport::default();
        let Some(stage) = self.stage() else {
            return report;
        };
        // Extent repairs emit notices of their own; drain until quiet.
        loop {
            let notices = match &self.token {
                Some(token) => token.drain(),
                None => Vec::new(),
            };
            if notices.is_empty() {
                break;
            }
            for notice in notices {
                self.handle(&stage, notice, &mut report);
            }
        }
        report
    }

    fn handle(&mut self, stage: &Stage, notice: StageNotice, report: &mut NotifyReport) {
        match notice {
            StageNotice::ObjectsChanged {
                resynced,
                changed_info_only,
            } => {
                let kind = classify(&self.observed, &resynced, &changed_info_only);
                match kind {
                    ChangeKind::Ignored => return,
                    ChangeKind::Resync => {
                        self.resync_counter += 1;
                        report.resyncs += 1;
                        self.bounds.clear();
                    }
                    ChangeKind::Update => {
                        if resynced.iter().chain(&changed_info_only).any(affects_bounds) {
                            self.bounds.clear();
                        }
                    }
                }
                self.update_counter += 1;
                report.updates += 1;

                let repair = repair_extents(stage, &changed_info_only);
                report.extents_repaired.extend(repair.repaired);
                report.conflicts.extend(repair.conflicts);
            }
            StageNotice::LayerMutingChanged { .. } => report.muting_changed = true,
            StageNotice::EditTargetChanged { identifier } => {
                match stage.layer_by_identifier(&identifier) {
                    Some(layer) => report.edit_target = Some(layer),
                    None => tracing::debug!(layer = %identifier, "edit target left the stack"),
                }
            }
            StageNotice::ContentsChanged => report.view_dirty = true,
        }
    }

    /// Bound of the observed subtree at `time`, memoized per time code.
    ///
    /// Pulled bounds are added on every miss. A detached notifier returns an empty box.
    pub fn compute_bounds(
        &mut self,
        time: TimeCode,
        mask: PurposeMask,
        pulled: &dyn PulledBounds,
    ) -> Box3d {
        let Some(stage) = self.stage() else {
            return Box3d::empty();
        };
        let observed = self.observed.clone();
        self.bounds.get_or_compute(time, mask, || {
            compute_world_bound(&stage, &observed, time, mask).union(&pulled.pulled_bounds())
        })
    }
}

#[cfg(test)]
#[path = "../../tests/unit/notify/notifier.rs"]
mod tests;

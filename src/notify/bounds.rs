use std::collections::BTreeMap;

use crate::foundation::core::{PrimPath, TimeCode};
use crate::foundation::math::{Box3d, Vec3};
use crate::layer::model::Value;
use crate::notify::extent::{EXTENT_ATTR, compute_extent, is_boundable};
use crate::stage::composed::Stage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
/// Draw-purpose toggles. Prims with the `default` purpose are always included.
pub struct PurposeMask {
    /// Include `render` purpose prims.
    pub render: bool,
    /// Include `proxy` purpose prims.
    pub proxy: bool,
    /// Include `guide` purpose prims.
    pub guide: bool,
}

impl Default for PurposeMask {
    fn default() -> Self {
        Self {
            render: false,
            proxy: true,
            guide: false,
        }
    }
}

impl PurposeMask {
    /// Return `true` when prims with `purpose` are included.
    pub fn includes(&self, purpose: &str) -> bool {
        match purpose {
            "render" => self.render,
            "proxy" => self.proxy,
            "guide" => self.guide,
            _ => true,
        }
    }
}

/// Bounds of prims temporarily edited outside the stage, added to every computed bound.
pub trait PulledBounds: Send + Sync {
    /// Combined bound of the pulled prims; empty when there are none.
    fn pulled_bounds(&self) -> Box3d;
}

/// [`PulledBounds`] with nothing pulled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPulledBounds;

impl PulledBounds for NoPulledBounds {
    fn pulled_bounds(&self) -> Box3d {
        Box3d::empty()
    }
}

fn token(stage: &Stage, prim: &PrimPath, name: &str, time: TimeCode) -> Option<String> {
    let path = prim.append_property(name).ok()?;
    match stage.attribute_value(&path, time)? {
        Value::Token(t) => Some(t),
        _ => None,
    }
}

fn translation(stage: &Stage, prim: &PrimPath, time: TimeCode) -> Vec3 {
    let mut total = [0.0; 3];
    for anc in prim.ancestors_inclusive() {
        if anc.is_absolute_root() {
            break;
        }
        let Ok(path) = anc.append_property("xformOp:translate") else {
            continue;
        };
        if let Some(t) = stage.attribute_value(&path, time).and_then(|v| v.as_vec3()) {
            for (acc, v) in total.iter_mut().zip(t) {
                *acc += v;
            }
        }
    }
    total
}

fn is_drawn(stage: &Stage, prim: &PrimPath, time: TimeCode, mask: PurposeMask) -> bool {
    let mut purpose = None;
    for anc in prim.ancestors_inclusive() {
        if anc.is_absolute_root() {
            break;
        }
        if token(stage, &anc, "visibility", time).as_deref() == Some("invisible") {
            return false;
        }
        if purpose.is_none() {
            purpose = token(stage, &anc, "purpose", time);
        }
    }
    mask.includes(purpose.as_deref().unwrap_or("default"))
}

fn local_bound(stage: &Stage, prim: &PrimPath, time: TimeCode) -> Option<Box3d> {
    let authored = prim
        .append_property(EXTENT_ATTR)
        .ok()
        .and_then(|p| stage.attribute_value(&p, time));
    match authored {
        Some(Value::Extent([min, max])) => Some(Box3d::new(min, max)),
        _ => compute_extent(stage, prim, time),
    }
}

/// World-space bound of the boundable prims at and beneath `root` at `time`.
///
/// Local bounds come from authored extents, else from the prim schema, and are moved by the
/// accumulated `xformOp:translate` of the prim and its ancestors. Invisible prims and prims whose
/// purpose `mask` excludes are skipped.
pub fn compute_world_bound(
    stage: &Stage,
    root: &PrimPath,
    time: TimeCode,
    mask: PurposeMask,
) -> Box3d {
    let mut out = Box3d::empty();
    for prim in stage.prims() {
        if !prim.path.has_prefix(root) || !is_boundable(&prim.type_name) {
            continue;
        }
        if !is_drawn(stage, &prim.path, time, mask) {
            continue;
        }
        if let Some(local) = local_bound(stage, &prim.path, time) {
            out = out.union(&local.translated(translation(stage, &prim.path, time)));
        }
    }
    out
}

/// Computed bounds memoized by time code.
///
/// Entries are valid for one purpose mask: asking with a different mask drops every entry first.
#[derive(Debug, Default)]
pub struct BoundingBoxCache {
    entries: BTreeMap<TimeCode, Box3d>,
    mask: Option<PurposeMask>,
}

impl BoundingBoxCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached bound at `time`, if any.
    pub fn get(&self, time: TimeCode) -> Option<Box3d> {
        self.entries.get(&time).copied()
    }

    /// Cached bound at `time` for `mask`, computing and storing it with `compute` on a miss.
    pub fn get_or_compute(
        &mut self,
        time: TimeCode,
        mask: PurposeMask,
        compute: impl FnOnce() -> Box3d,
    ) -> Box3d {
        if self.mask != Some(mask) {
            if !self.entries.is_empty() {
                tracing::debug!("purpose mask changed, dropping cached bounds");
            }
            self.entries.clear();
            self.mask = Some(mask);
        }
        *self.entries.entry(time).or_insert_with(compute)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached time codes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[path = "../../tests/unit/notify/bounds.rs"]
mod tests;

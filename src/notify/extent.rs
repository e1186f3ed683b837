use std::collections::BTreeSet;

use crate::foundation::core::{PrimPath, TimeCode};
use crate::foundation::error::{StageError, StageResult};
use crate::foundation::math::Box3d;
use crate::layer::model::Value;
use crate::stage::composed::Stage;

/// Name of the authored bound attribute of boundable prims.
pub const EXTENT_ATTR: &str = "extent";

/// Attributes shared by every geometric prim. None of them changes an extent.
pub const GPRIM_ATTRIBUTES: &[&str] = &[
    "doubleSided",
    "extent",
    "orientation",
    "primvars:displayColor",
    "primvars:displayOpacity",
    "proxyPrim",
    "purpose",
    "visibility",
    "xformOpOrder",
];

type ComputeExtent = fn(&Stage, &PrimPath, TimeCode) -> Option<Box3d>;

struct BoundableSchema {
    type_name: &'static str,
    attributes: &'static [&'static str],
    compute: ComputeExtent,
}

const SCHEMAS: &[BoundableSchema] = &[
    BoundableSchema {
        type_name: "Sphere",
        attributes: &["radius"],
        compute: sphere_extent,
    },
    BoundableSchema {
        type_name: "Cube",
        attributes: &["size"],
        compute: cube_extent,
    },
    BoundableSchema {
        type_name: "Mesh",
        attributes: &["points"],
        compute: points_extent,
    },
    BoundableSchema {
        type_name: "Points",
        attributes: &["points"],
        compute: points_extent,
    },
];

fn schema(type_name: &str) -> Option<&'static BoundableSchema> {
    SCHEMAS.iter().find(|s| s.type_name == type_name)
}

fn scalar(stage: &Stage, prim: &PrimPath, name: &str, time: TimeCode) -> Option<f64> {
    let path = prim.append_property(name).ok()?;
    stage.attribute_value(&path, time)?.as_f64()
}

fn sphere_extent(stage: &Stage, prim: &PrimPath, time: TimeCode) -> Option<Box3d> {
    let r = scalar(stage, prim, "radius", time).unwrap_or(1.0).abs();
    Some(Box3d::new([-r; 3], [r; 3]))
}

fn cube_extent(stage: &Stage, prim: &PrimPath, time: TimeCode) -> Option<Box3d> {
    let h = scalar(stage, prim, "size", time).unwrap_or(2.0).abs() * 0.5;
    Some(Box3d::new([-h; 3], [h; 3]))
}

fn points_extent(stage: &Stage, prim: &PrimPath, time: TimeCode) -> Option<Box3d> {
    let path = prim.append_property("points").ok()?;
    match stage.attribute_value(&path, time)? {
        Value::Points(points) => Some(Box3d::from_points(&points)),
        _ => None,
    }
}

/// Return `true` when prims of `type_name` carry an extent.
pub fn is_boundable(type_name: &str) -> bool {
    schema(type_name).is_some()
}

/// Return `true` when `attribute` is part of the schema of `type_name` (its own attributes plus
/// the shared geometric ones).
pub fn is_schema_attribute(type_name: &str, attribute: &str) -> bool {
    schema(type_name)
        .is_some_and(|s| s.attributes.contains(&attribute) || GPRIM_ATTRIBUTES.contains(&attribute))
}

/// Extent of the prim at `prim` computed from its schema attributes at `time`.
pub fn compute_extent(stage: &Stage, prim: &PrimPath, time: TimeCode) -> Option<Box3d> {
    let composed = stage.prim(prim)?;
    let schema = schema(&composed.type_name)?;
    (schema.compute)(stage, prim, time)
}

#[derive(Debug, Default)]
/// Outcome of one extent repair pass.
pub struct ExtentRepair {
    /// Prims whose extent was rewritten.
    pub repaired: Vec<PrimPath>,
    /// Prims whose extent is animated and was left alone.
    pub conflicts: Vec<StageError>,
}

/// Rewrite stale authored extents after the properties at `changed` changed.
///
/// Only schema attributes that are not shared geometric attributes can move an extent. An
/// extent with time samples is reported as a conflict instead of being rewritten. Extents are
/// written at the default time through the stage edit target.
pub fn repair_extents(stage: &Stage, changed: &[PrimPath]) -> ExtentRepair {
    let mut out = ExtentRepair::default();
    let mut seen = BTreeSet::new();
    for path in changed {
        if !path.is_property_path() {
            continue;
        }
        let name = path.name();
        if name == EXTENT_ATTR {
            continue;
        }
        let prim_path = path.prim_path();
        let Some(prim) = stage.prim(&prim_path) else {
            continue;
        };
        if !is_boundable(&prim.type_name)
            || !is_schema_attribute(&prim.type_name, name)
            || GPRIM_ATTRIBUTES.contains(&name)
        {
            continue;
        }
        if !seen.insert(prim_path.clone()) {
            continue;
        }
        match repair_one(stage, &prim_path, name) {
            Ok(true) => out.repaired.push(prim_path),
            Ok(false) => {}
            Err(e @ StageError::AnimatedExtentConflict(_)) => {
                tracing::warn!(prim = %prim_path, error = %e, "extent left unchanged");
                out.conflicts.push(e);
            }
            Err(e) => tracing::warn!(prim = %prim_path, error = %e, "failed to repair extent"),
        }
    }
    out
}

fn repair_one(stage: &Stage, prim: &PrimPath, changed: &str) -> StageResult<bool> {
    let extent_path = prim.append_property(EXTENT_ATTR)?;
    let Some(extent) = stage.attribute(&extent_path) else {
        return Ok(false);
    };
    if !extent.samples.is_empty() {
        return Err(StageError::animated_extent(format!(
            "cannot fix animated extent of {prim} made dirty by a change on '{changed}'"
        )));
    }
    if extent.default.is_none() {
        return Ok(false);
    }
    let Some(bound) = compute_extent(stage, prim, TimeCode::Default) else {
        return Ok(false);
    };
    let value = Value::Extent(bound.to_extent());
    if extent.default.as_ref() == Some(&value) {
        return Ok(false);
    }
    stage.set_attribute(&extent_path, TimeCode::Default, value)?;
    tracing::debug!(prim = %prim, "repaired extent");
    Ok(true)
}

#[cfg(test)]
#[path = "../../tests/unit/notify/extent.rs"]
mod tests;

use crate::foundation::core::PrimPath;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// How an objects-changed notice affects a consumer observing one subtree of a stage.
pub enum ChangeKind {
    /// Nothing observable changed.
    Ignored,
    /// Values changed; the topology is intact.
    Update,
    /// Topology changed. Implies an update.
    Resync,
}

fn overlaps(path: &PrimPath, observed: &PrimPath) -> bool {
    if path.is_empty() || observed.is_empty() {
        return false;
    }
    let prim = path.prim_path();
    prim.has_prefix(observed) || observed.has_prefix(&prim)
}

/// Classify an objects-changed notice for a consumer observing `observed` and beneath.
///
/// A resynced prim path overlapping the observed subtree is a [`ChangeKind::Resync`]. A resynced
/// property path (attribute created or removed) or an overlapping info-only path is a
/// [`ChangeKind::Update`].
pub fn classify(observed: &PrimPath, resynced: &[PrimPath], info_only: &[PrimPath]) -> ChangeKind {
    let mut kind = ChangeKind::Ignored;
    for p in resynced.iter().filter(|p| overlaps(p, observed)) {
        if !p.is_property_path() {
            return ChangeKind::Resync;
        }
        kind = ChangeKind::Update;
    }
    if kind == ChangeKind::Ignored && info_only.iter().any(|p| overlaps(p, observed)) {
        kind = ChangeKind::Update;
    }
    kind
}

const BOUNDS_ATTRIBUTES: &[&str] = &[
    "extent",
    "visibility",
    "purpose",
    "xformOpOrder",
    "radius",
    "size",
    "points",
];

/// Return `true` when a change at `path` can move a computed bound.
pub fn affects_bounds(path: &PrimPath) -> bool {
    if !path.is_property_path() {
        return false;
    }
    let name = path.name();
    name.starts_with("xformOp:") || BOUNDS_ATTRIBUTES.contains(&name)
}

#[cfg(test)]
#[path = "../../tests/unit/notify/classify.rs"]
mod tests;

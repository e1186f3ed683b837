use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::layer::model::Layer;
use crate::layer::store::LayerStore;

/// Depth-first, strongest-first closure of `roots` and all of their sublayers.
///
/// Each layer appears once; sublayers that cannot be found or opened are skipped.
pub fn sublayer_refs(store: &LayerStore, roots: &[Arc<Layer>]) -> Vec<Arc<Layer>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    for root in roots {
        visit(store, root.clone(), &mut visited, &mut out);
    }
    out
}

fn visit(
    store: &LayerStore,
    layer: Arc<Layer>,
    visited: &mut HashSet<String>,
    out: &mut Vec<Arc<Layer>>,
) {
    if !visited.insert(layer.identifier().to_string()) {
        return;
    }
    let subs = layer.sublayers();
    out.push(layer);
    for id in subs {
        match store.find_or_open(&id) {
            Ok(sub) => visit(store, sub, visited, out),
            Err(e) => tracing::debug!(sublayer = %id, error = %e, "skipping unresolvable sublayer"),
        }
    }
}

/// Identifiers of the sublayer closure of `roots`, roots included.
pub fn sublayer_identifiers(store: &LayerStore, roots: &[Arc<Layer>]) -> BTreeSet<String> {
    sublayer_refs(store, roots)
        .iter()
        .map(|l| l.identifier().to_string())
        .collect()
}

/// Depth-first rewrite of sublayer identifiers beneath `layer`.
///
/// Each entry of `remapped` maps an old identifier to a new one; an empty new identifier drops
/// the sublayer. Nested sublayers are rewritten before their parent. Returns `true` when any
/// sublayer list changed.
pub fn remap_sublayers(
    store: &LayerStore,
    layer: &Arc<Layer>,
    remapped: &BTreeMap<String, String>,
) -> bool {
    if remapped.is_empty() {
        return false;
    }
    let mut visited = HashSet::new();
    remap_recursive(store, layer, remapped, &mut visited)
}

fn remap_recursive(
    store: &LayerStore,
    layer: &Arc<Layer>,
    remapped: &BTreeMap<String, String>,
    visited: &mut HashSet<String>,
) -> bool {
    if !visited.insert(layer.identifier().to_string()) {
        return false;
    }
    let mut any = false;
    let current = layer.sublayers();
    let mut rewritten = Vec::with_capacity(current.len());
    let mut updated = false;
    for id in current {
        if let Some(sub) = store.find(&id) {
            any |= remap_recursive(store, &sub, remapped, visited);
        }
        match remapped.get(&id) {
            Some(new_id) => {
                updated = true;
                if !new_id.is_empty() && !rewritten.contains(new_id) {
                    rewritten.push(new_id.clone());
                }
            }
            None => rewritten.push(id),
        }
    }
    if updated {
        tracing::debug!(layer = layer.identifier(), "remapped sublayers");
        layer.set_sublayers(rewritten);
    }
    any || updated
}

#[cfg(test)]
#[path = "../../tests/unit/layer/sublayers.rs"]
mod tests;

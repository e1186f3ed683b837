use super::*;

use std::sync::Arc;

use crate::layer::source::MemorySource;
use crate::layer::store::LayerStore;
use crate::stage::load_rules::InitialLoadSet;

fn p(s: &str) -> PrimPath {
    PrimPath::parse(s).unwrap()
}

fn stage() -> Arc<Stage> {
    let store = Arc::new(LayerStore::new(Arc::new(MemorySource::new())));
    let root = store.create_anonymous("root");
    let session = store.create_anonymous("session");
    Stage::open(store, root, session, InitialLoadSet::LoadAll)
}

fn set(stage: &Stage, path: &str, value: Value) {
    stage
        .set_attribute(&p(path), TimeCode::Default, value)
        .unwrap();
}

#[test]
fn bound_accumulates_ancestor_translations() {
    let stage = stage();
    stage.define_prim(&p("/World"), "Xform").unwrap();
    set(&stage, "/World.xformOp:translate", Value::Vec3([10.0, 0.0, 0.0]));
    stage.define_prim(&p("/World/Ball"), "Sphere").unwrap();
    set(&stage, "/World/Ball.radius", Value::Double(1.0));
    set(&stage, "/World/Ball.xformOp:translate", Value::Vec3([0.0, 5.0, 0.0]));

    let b = compute_world_bound(
        &stage,
        &PrimPath::absolute_root(),
        TimeCode::Default,
        PurposeMask::default(),
    );
    assert_eq!(b, Box3d::new([9.0, 4.0, -1.0], [11.0, 6.0, 1.0]));
}

#[test]
fn authored_extent_wins_over_schema() {
    let stage = stage();
    stage.define_prim(&p("/Ball"), "Sphere").unwrap();
    set(&stage, "/Ball.radius", Value::Double(1.0));
    set(&stage, "/Ball.extent", Value::Extent([[0.0; 3], [0.5; 3]]));
    let b = compute_world_bound(
        &stage,
        &PrimPath::absolute_root(),
        TimeCode::Default,
        PurposeMask::default(),
    );
    assert_eq!(b, Box3d::new([0.0; 3], [0.5; 3]));
}

#[test]
fn purpose_and_visibility_filter_prims() {
    let stage = stage();
    stage.define_prim(&p("/Guide"), "Cube").unwrap();
    set(&stage, "/Guide.purpose", Value::Token("guide".into()));
    stage.define_prim(&p("/Hidden"), "Cube").unwrap();
    set(&stage, "/Hidden.visibility", Value::Token("invisible".into()));

    let root = PrimPath::absolute_root();
    let default_mask = PurposeMask::default();
    assert!(compute_world_bound(&stage, &root, TimeCode::Default, default_mask).is_empty());

    let with_guides = PurposeMask {
        guide: true,
        ..PurposeMask::default()
    };
    assert_eq!(
        compute_world_bound(&stage, &root, TimeCode::Default, with_guides),
        Box3d::new([-1.0; 3], [1.0; 3])
    );
}

#[test]
fn cache_memoizes_per_time_and_resets_on_mask_change() {
    let mut cache = BoundingBoxCache::new();
    let mask = PurposeMask::default();
    let unit = Box3d::new([0.0; 3], [1.0; 3]);
    let mut calls = 0;
    let mut compute = || {
        calls += 1;
        unit
    };
    assert_eq!(cache.get_or_compute(TimeCode::At(1.0), mask, &mut compute), unit);
    assert_eq!(cache.get_or_compute(TimeCode::At(1.0), mask, &mut compute), unit);
    assert_eq!(calls, 1);
    assert_eq!(cache.len(), 1);

    let other = PurposeMask {
        render: true,
        ..mask
    };
    cache.get_or_compute(TimeCode::Default, other, Box3d::empty);
    assert_eq!(cache.len(), 1);
    assert!(cache.get(TimeCode::At(1.0)).is_none());

    cache.clear();
    assert!(cache.is_empty());
}

#[test]
fn no_pulled_bounds_is_empty() {
    assert!(NoPulledBounds.pulled_bounds().is_empty());
}

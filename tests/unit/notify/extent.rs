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

fn sphere(stage: &Stage, path: &str, radius: f64) {
    let prim = p(path);
    stage.define_prim(&prim, "Sphere").unwrap();
    stage
        .set_attribute(
            &prim.append_property("radius").unwrap(),
            TimeCode::Default,
            Value::Double(radius),
        )
        .unwrap();
}

#[test]
fn schema_tables() {
    assert!(is_boundable("Sphere"));
    assert!(!is_boundable("Xform"));
    assert!(is_schema_attribute("Sphere", "radius"));
    assert!(is_schema_attribute("Sphere", "doubleSided"));
    assert!(!is_schema_attribute("Sphere", "size"));
}

#[test]
fn plugins_compute_extents() {
    let stage = stage();
    sphere(&stage, "/S", 2.0);
    assert_eq!(
        compute_extent(&stage, &p("/S"), TimeCode::Default),
        Some(Box3d::new([-2.0; 3], [2.0; 3]))
    );

    stage.define_prim(&p("/M"), "Mesh").unwrap();
    stage
        .set_attribute(
            &p("/M.points"),
            TimeCode::Default,
            Value::Points(vec![[0.0, 0.0, 0.0], [1.0, 2.0, 3.0]]),
        )
        .unwrap();
    assert_eq!(
        compute_extent(&stage, &p("/M"), TimeCode::Default),
        Some(Box3d::new([0.0; 3], [1.0, 2.0, 3.0]))
    );
    assert_eq!(compute_extent(&stage, &p("/Nope"), TimeCode::Default), None);
}

#[test]
fn authored_extent_is_rewritten_after_schema_change() {
    let stage = stage();
    sphere(&stage, "/S", 1.0);
    stage
        .set_attribute(
            &p("/S.extent"),
            TimeCode::Default,
            Value::Extent([[-1.0; 3], [1.0; 3]]),
        )
        .unwrap();
    stage
        .set_attribute(&p("/S.radius"), TimeCode::Default, Value::Double(3.0))
        .unwrap();

    let out = repair_extents(&stage, &[p("/S.radius")]);
    assert_eq!(out.repaired, vec![p("/S")]);
    assert!(out.conflicts.is_empty());
    assert_eq!(
        stage.attribute_value(&p("/S.extent"), TimeCode::Default),
        Some(Value::Extent([[-3.0; 3], [3.0; 3]]))
    );

    // Already up to date.
    assert!(repair_extents(&stage, &[p("/S.radius")]).repaired.is_empty());
}

#[test]
fn unauthored_extent_and_gprim_attributes_are_skipped() {
    let stage = stage();
    sphere(&stage, "/S", 1.0);
    let out = repair_extents(&stage, &[p("/S.radius"), p("/S.doubleSided"), p("/S")]);
    assert!(out.repaired.is_empty());
    assert!(stage.attribute(&p("/S.extent")).is_none());
}

#[test]
fn animated_extent_is_a_conflict() {
    let stage = stage();
    sphere(&stage, "/S", 1.0);
    stage
        .set_attribute(
            &p("/S.extent"),
            TimeCode::At(1.0),
            Value::Extent([[-1.0; 3], [1.0; 3]]),
        )
        .unwrap();
    let out = repair_extents(&stage, &[p("/S.radius")]);
    assert!(out.repaired.is_empty());
    assert_eq!(out.conflicts.len(), 1);
    assert!(matches!(
        out.conflicts[0],
        StageError::AnimatedExtentConflict(_)
    ));
}

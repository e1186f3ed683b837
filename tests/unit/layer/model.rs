use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};

fn p(s: &str) -> PrimPath {
    PrimPath::parse(s).unwrap()
}

fn layer(id: &str) -> Arc<Layer> {
    Layer::new(id.to_string(), "t".to_string(), LayerContent::default(), true)
}

#[derive(Default)]
struct Recorder {
    calls: AtomicUsize,
    last: Mutex<Option<LayerChange>>,
}

impl LayerObserver for Recorder {
    fn layer_changed(&self, _layer: &Arc<Layer>, change: &LayerChange) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(change.clone());
    }
}

#[test]
fn held_samples_then_default() {
    let attr = Attribute {
        default: Some(Value::Double(1.0)),
        samples: vec![(1.0, Value::Double(10.0)), (5.0, Value::Double(50.0))],
    };
    assert_eq!(attr.value_at(TimeCode::Default), Some(&Value::Double(1.0)));
    assert_eq!(attr.value_at(TimeCode::At(0.0)), Some(&Value::Double(10.0)));
    assert_eq!(attr.value_at(TimeCode::At(3.0)), Some(&Value::Double(10.0)));
    assert_eq!(attr.value_at(TimeCode::At(9.0)), Some(&Value::Double(50.0)));

    let only_default = Attribute {
        default: Some(Value::Bool(true)),
        samples: vec![],
    };
    assert_eq!(only_default.value_at(TimeCode::At(2.0)), Some(&Value::Bool(true)));
}

#[test]
fn new_attribute_resyncs_existing_attribute_changes_info() {
    let l = layer("anon:1:t");
    let rec: Arc<Recorder> = Arc::new(Recorder::default());
    let weak: Weak<dyn LayerObserver> = Arc::downgrade(&(rec.clone() as Arc<dyn LayerObserver>));
    l.add_observer(weak.clone());
    l.add_observer(weak);

    l.set_attribute(&p("/A.radius"), TimeCode::Default, Value::Double(1.0))
        .unwrap();
    let first = rec.last.lock().clone().unwrap();
    assert_eq!(first.resynced, vec![p("/A.radius")]);

    l.set_attribute(&p("/A.radius"), TimeCode::Default, Value::Double(2.0))
        .unwrap();
    let second = rec.last.lock().clone().unwrap();
    assert!(second.resynced.is_empty());
    assert_eq!(second.info_only, vec![p("/A.radius")]);
    assert_eq!(rec.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn unchanged_sublayers_do_not_notify() {
    let l = layer("anon:2:t");
    let rec: Arc<Recorder> = Arc::new(Recorder::default());
    l.add_observer(Arc::downgrade(&(rec.clone() as Arc<dyn LayerObserver>)));

    l.set_sublayers(vec!["/a.json".to_string()]);
    l.set_sublayers(vec!["/a.json".to_string()]);
    assert_eq!(rec.calls.load(Ordering::SeqCst), 1);
    assert!(rec.last.lock().as_ref().unwrap().sublayers_changed);
    assert!(l.is_dirty());
}

#[test]
fn digest_tracks_content() {
    let a = layer("anon:3:t");
    let b = layer("anon:4:t");
    assert_eq!(a.digest(), b.digest());

    a.define_prim(&p("/World"), "Xform").unwrap();
    assert_ne!(a.digest(), b.digest());

    b.transfer_content(&a);
    assert_eq!(a.digest(), b.digest());

    b.clear();
    assert!(b.is_empty());
}

#[test]
fn remove_prim_drops_subtree() {
    let l = layer("anon:5:t");
    l.define_prim(&p("/A"), "Xform").unwrap();
    l.define_prim(&p("/A/B"), "Sphere").unwrap();
    l.define_prim(&p("/AB"), "Sphere").unwrap();
    l.remove_prim(&p("/A")).unwrap();
    assert!(l.prim(&p("/A/B")).is_none());
    assert!(l.prim(&p("/AB")).is_some());
    assert!(l.remove_prim(&p("/")).is_err());
}

#[test]
fn lock_denies_edit_and_save() {
    let l = layer("/x.json");
    assert!(!l.is_anonymous());
    l.set_locked(true);
    assert!(!l.permission_to_edit());
    assert!(!l.permission_to_save());
    l.set_locked(false);
    assert!(l.permission_to_edit());
}

#[test]
fn custom_strings_round_trip() {
    let l = layer("anon:6:t");
    l.set_custom_strings(REFERENCED_LAYERS_KEY, vec!["anon:1:x".to_string()]);
    assert_eq!(l.custom_strings(REFERENCED_LAYERS_KEY), vec!["anon:1:x"]);
    l.set_custom_strings(REFERENCED_LAYERS_KEY, vec![]);
    assert!(l.custom_strings(REFERENCED_LAYERS_KEY).is_empty());
}

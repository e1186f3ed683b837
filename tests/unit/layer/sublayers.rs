use super::*;

use crate::layer::model::LayerContent;
use crate::layer::source::MemorySource;

fn store() -> LayerStore {
    let src = Arc::new(MemorySource::new());
    src.insert(
        "/a.json",
        LayerContent {
            sublayers: vec!["/b.json".to_string(), "/missing.json".to_string()],
            ..LayerContent::default()
        },
    );
    src.insert("/b.json", LayerContent::default());
    LayerStore::new(src)
}

#[test]
fn closure_is_depth_first_and_skips_missing() {
    let store = store();
    let root = store.create_anonymous("root");
    root.set_sublayers(vec!["/a.json".to_string(), "/b.json".to_string()]);

    let ids: Vec<String> = sublayer_refs(&store, &[root.clone()])
        .iter()
        .map(|l| l.identifier().to_string())
        .collect();
    assert_eq!(
        ids,
        vec![root.identifier().to_string(), "/a.json".into(), "/b.json".into()]
    );
}

#[test]
fn closure_survives_cycles() {
    let store = store();
    let a = store.create_anonymous("a");
    let b = store.create_anonymous("b");
    a.set_sublayers(vec![b.identifier().to_string()]);
    b.set_sublayers(vec![a.identifier().to_string()]);
    assert_eq!(sublayer_identifiers(&store, &[a.clone()]).len(), 2);
    assert!(!remap_sublayers(
        &store,
        &a,
        &BTreeMap::from([("nothing".to_string(), "x".to_string())])
    ));
}

#[test]
fn remap_rewrites_nested_anonymous_sublayers() {
    let store = store();
    let wrapper = store.create_anonymous("unshareableLayer");
    let nested = store.create_anonymous("nested");
    let old = store.create_anonymous("old");
    nested.set_sublayers(vec![old.identifier().to_string()]);
    wrapper.set_sublayers(vec![nested.identifier().to_string(), old.identifier().to_string()]);

    let map = BTreeMap::from([(old.identifier().to_string(), "/a.json".to_string())]);
    assert!(remap_sublayers(&store, &wrapper, &map));
    assert_eq!(nested.sublayers(), vec!["/a.json".to_string()]);
    assert_eq!(
        wrapper.sublayers(),
        vec![nested.identifier().to_string(), "/a.json".to_string()]
    );
}

#[test]
fn remap_to_empty_drops_the_sublayer() {
    let store = store();
    let l = store.create_anonymous("l");
    l.set_sublayers(vec!["/a.json".to_string(), "/b.json".to_string()]);
    let map = BTreeMap::from([("/a.json".to_string(), String::new())]);
    assert!(remap_sublayers(&store, &l, &map));
    assert_eq!(l.sublayers(), vec!["/b.json".to_string()]);
}

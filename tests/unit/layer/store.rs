use super::*;

use crate::layer::source::MemorySource;

fn store_with(entries: &[(&str, LayerContent)]) -> (Arc<MemorySource>, LayerStore) {
    let src = Arc::new(MemorySource::new());
    for (id, c) in entries {
        src.insert(*id, c.clone());
    }
    let store = LayerStore::new(src.clone());
    (src, store)
}

#[test]
fn anonymous_identifiers_are_unique_and_tagged() {
    let (_, store) = store_with(&[]);
    let a = store.create_anonymous("root");
    let b = store.create_anonymous("root");
    assert_ne!(a.identifier(), b.identifier());
    assert!(a.identifier().starts_with("anon:"));
    assert!(a.identifier().ends_with(":root"));
    assert!(a.is_anonymous());
    assert!(Arc::ptr_eq(&store.find(a.identifier()).unwrap(), &a));
}

#[test]
fn find_or_open_reuses_live_layer() {
    let (_, store) = store_with(&[("/a.json", LayerContent::default())]);
    let a1 = store.find_or_open("/a.json").unwrap();
    let a2 = store.find_or_open("/a.json").unwrap();
    assert!(Arc::ptr_eq(&a1, &a2));
    assert!(store.find_or_open("/missing.json").is_err());
    assert!(store.find_or_open("").is_err());
}

#[test]
fn dead_anonymous_layers_cannot_be_reopened() {
    let (_, store) = store_with(&[]);
    let id = store.create_anonymous("gone").identifier().to_string();
    assert!(store.find(&id).is_none());
    assert!(store.find_or_open(&id).is_err());
}

#[test]
fn read_only_source_denies_edit() {
    let src = Arc::new(MemorySource::new());
    src.insert_read_only("/ro.json", LayerContent::default());
    let store = LayerStore::new(src);
    let l = store.find_or_open("/ro.json").unwrap();
    assert!(!l.permission_to_edit());
}

#[test]
fn save_as_exports_and_opens_file_backed_layer() {
    let (src, store) = store_with(&[]);
    let anon = store.create_anonymous("root");
    anon.set_fps(Some(30.0));

    let saved = store.save_as(&anon, "/saved.json").unwrap();
    assert_eq!(saved.identifier(), "/saved.json");
    assert!(!saved.is_anonymous());
    assert_eq!(saved.fps(), Some(30.0));
    assert!(!saved.is_dirty());
    assert!(src.contains("/saved.json"));
    assert!(store.save_as(&anon, "anon:9:x").is_err());
}

#[test]
fn save_writes_back_and_rejects_anonymous() {
    let (src, store) = store_with(&[("/a.json", LayerContent::default())]);
    let a = store.find_or_open("/a.json").unwrap();
    a.set_tcps(Some(12.0));
    assert!(a.is_dirty());
    store.save(&a).unwrap();
    assert!(!a.is_dirty());
    assert_eq!(src.read("/a.json").unwrap().unwrap().tcps, Some(12.0));

    let anon = store.create_anonymous("x");
    assert!(store.save(&anon).is_err());
}

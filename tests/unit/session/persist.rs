use super::*;

use crate::foundation::core::PrimPath;
use crate::layer::model::LayerContent;
use crate::layer::source::MemorySource;
use crate::resolve::host::DatabaseLayerProvider;
use crate::session::consumer::EvalContext;
use crate::stage::cache::StageCache;

fn source() -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    source.insert("/a.json", LayerContent::default());
    source.insert("/sub.json", LayerContent::default());
    source
}

fn services_with_db(source: Arc<MemorySource>) -> (EngineServices, Arc<LayerDatabase>) {
    let store = Arc::new(LayerStore::new(source));
    let db = Arc::new(LayerDatabase::new(store.clone()));
    let services = EngineServices::new(Arc::new(StageCache::new(store)))
        .with_provider(Arc::new(DatabaseLayerProvider::new(db.clone())));
    (services, db)
}

fn p(s: &str) -> PrimPath {
    PrimPath::parse(s).unwrap()
}

fn new_consumer(services: &EngineServices, file: &str) -> StageConsumer {
    let snapshot = HostSnapshot {
        file_path: file.to_string(),
        ..HostSnapshot::default()
    };
    StageConsumer::new(services.clone(), snapshot)
}

#[test]
fn persisted_consumer_restores_its_anonymous_layers() {
    let source = source();
    let (services, db) = services_with_db(source.clone());
    let mut c = new_consumer(&services, "");
    let stage = c.compute(EvalContext::Normal, None).unwrap().stage;
    let old_root = stage.root_layer().identifier().to_string();
    let old_session = stage.session_layer().identifier().to_string();
    stage.root_layer().set_sublayers(vec!["/sub.json".to_string()]);
    stage.define_prim(&p("/World"), "Xform").unwrap();
    stage.session_layer().define_prim(&p("/Sess"), "Xform").unwrap();
    c.mute_layer("/sub.json");
    c.set_edit_target(&old_session).unwrap();

    let saved = c.persist(&db);
    assert_eq!(saved.snapshot.root_layer_name, old_root);
    assert_eq!(saved.snapshot.session_layer_name, old_session);
    assert_eq!(saved.snapshot.edit_target_layer_id, old_session);
    let json = serde_json::to_string(&saved).unwrap();
    let saved: PersistedConsumer = serde_json::from_str(&json).unwrap();

    // A fresh process numbers anonymous layers from scratch.
    let (services2, db2) = services_with_db(source);
    let _earlier: Vec<_> = (0..8)
        .map(|_| services2.cache.store().create_anonymous("other"))
        .collect();
    let mut restored = saved.restore(services2, &db2);
    let stage = restored.compute(EvalContext::Normal, None).unwrap().stage;

    let root = stage.root_layer();
    assert!(root.is_anonymous());
    assert_ne!(root.identifier(), old_root);
    assert_eq!(root.sublayers(), vec!["/sub.json"]);
    assert!(stage.has_prim(&p("/World")));
    assert!(stage.has_prim(&p("/Sess")));
    assert_ne!(stage.session_layer().identifier(), old_session);
    assert!(Arc::ptr_eq(&stage.edit_target(), stage.session_layer()));
    assert!(stage.is_layer_muted("/sub.json"));
    assert!(Arc::ptr_eq(
        restored.resolver().anonymous_root().unwrap(),
        root
    ));
}

#[test]
fn persisted_unshared_consumer_restores_its_wrapper() {
    let source = source();
    let (services, db) = services_with_db(source.clone());
    let mut c = new_consumer(&services, "/a.json");
    c.set_share_stage(false);
    let stage = c.compute(EvalContext::Normal, None).unwrap().stage;
    stage.session_layer().define_prim(&p("/Private"), "Xform").unwrap();
    let old_wrapper = stage.root_layer().identifier().to_string();

    let saved = c.persist(&db);
    assert_eq!(saved.snapshot.root_layer_name, old_wrapper);

    let (services2, db2) = services_with_db(source);
    let _earlier: Vec<_> = (0..8)
        .map(|_| services2.cache.store().create_anonymous("other"))
        .collect();
    let mut restored = saved.restore(services2, &db2);
    let stage = restored.compute(EvalContext::Normal, None).unwrap().stage;

    let wrapper = stage.root_layer();
    assert_ne!(wrapper.identifier(), old_wrapper);
    assert_eq!(wrapper.sublayers(), vec!["/a.json"]);
    assert!(stage.has_prim(&p("/Private")));
    assert_eq!(restored.share_mode(), ShareMode::Unshared);
}

#[test]
fn persisted_consumer_round_trips_through_a_file() {
    let (services, db) = services_with_db(source());
    let mut c = new_consumer(&services, "/a.json");
    c.compute(EvalContext::Normal, None).unwrap();
    let saved = c.persist(&db);

    let dir = std::env::temp_dir().join(format!("stageshare_persist_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("consumer.json");
    saved.to_path(&path).unwrap();
    let loaded = PersistedConsumer::from_path(&path).unwrap();
    assert_eq!(loaded, saved);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn duplicate_copies_anonymous_layers() {
    let (services, _db) = services_with_db(source());
    let mut c = new_consumer(&services, "");
    let original = c.compute(EvalContext::Normal, None).unwrap().stage;
    original.define_prim(&p("/World"), "Xform").unwrap();
    original
        .session_layer()
        .define_prim(&p("/Sess"), "Xform")
        .unwrap();
    c.set_edit_target(original.session_layer().identifier()).unwrap();

    let mut dup = c.duplicate().unwrap();
    let copy = dup.compute(EvalContext::Normal, None).unwrap().stage;
    assert!(!Arc::ptr_eq(&copy, &original));
    assert_ne!(copy.root_layer().identifier(), original.root_layer().identifier());
    assert_ne!(
        copy.session_layer().identifier(),
        original.session_layer().identifier()
    );
    assert!(copy.has_prim(&p("/World")));
    assert!(copy.has_prim(&p("/Sess")));
    assert!(Arc::ptr_eq(&copy.edit_target(), copy.session_layer()));
    assert_eq!(dup.snapshot().file_path, copy.root_layer().identifier());

    copy.define_prim(&p("/OnlyInCopy"), "Xform").unwrap();
    assert!(!original.has_prim(&p("/OnlyInCopy")));

    // Recomputing keeps the copy.
    let again = dup.compute(EvalContext::Normal, None).unwrap().stage;
    assert!(Arc::ptr_eq(&again, &copy));
}

#[test]
fn duplicate_moves_the_edit_target_to_the_copied_sublayer() {
    let (services, _db) = services_with_db(source());
    let mut c = new_consumer(&services, "");
    let original = c.compute(EvalContext::Normal, None).unwrap().stage;
    let store = services.cache.store();
    let sub = store.create_anonymous("mySub");
    original
        .root_layer()
        .set_sublayers(vec![sub.identifier().to_string()]);
    c.set_edit_target(sub.identifier()).unwrap();
    c.compute(EvalContext::Normal, None).unwrap();
    assert!(Arc::ptr_eq(&original.edit_target(), &sub));

    let mut dup = c.duplicate().unwrap();
    let copy = dup.compute(EvalContext::Normal, None).unwrap().stage;
    let target = copy.edit_target();
    assert_eq!(target.tag(), "mySub");
    assert!(!Arc::ptr_eq(&target, &sub));
    assert_eq!(
        copy.root_layer().sublayers(),
        vec![target.identifier().to_string()]
    );
}

#[test]
fn duplicate_shares_file_backed_roots() {
    let (services, _db) = services_with_db(source());
    let mut c = new_consumer(&services, "/a.json");
    let original = c.compute(EvalContext::Normal, None).unwrap().stage;

    let mut dup = c.duplicate().unwrap();
    let copy = dup.compute(EvalContext::Normal, None).unwrap().stage;
    assert!(!Arc::ptr_eq(&copy, &original));
    assert!(Arc::ptr_eq(copy.root_layer(), original.root_layer()));
    assert!(!Arc::ptr_eq(copy.session_layer(), original.session_layer()));
    assert!(Arc::ptr_eq(&copy.edit_target(), copy.root_layer()));
    assert_eq!(dup.snapshot().file_path, "/a.json");
}

#[test]
fn duplicate_before_compute_is_a_plain_copy_of_the_inputs() {
    let (services, _db) = services_with_db(source());
    let c = new_consumer(&services, "/a.json");
    let dup = c.duplicate().unwrap();
    assert_eq!(dup.snapshot(), c.snapshot());
    assert!(dup.stage().is_none());
}

use super::*;

use crate::foundation::core::PrimPath;
use crate::layer::database::LayerDatabase;
use crate::layer::model::LayerContent;
use crate::layer::source::MemorySource;
use crate::resolve::host::{DatabaseLayerProvider, NoLayerProvider};
use crate::stage::load_rules::InitialLoadSet;

struct Env {
    source: Arc<MemorySource>,
    cache: StageCache,
    opts: EngineOpts,
}

fn env() -> Env {
    let source = Arc::new(MemorySource::new());
    let store = Arc::new(LayerStore::new(source.clone()));
    Env {
        source,
        cache: StageCache::new(store),
        opts: EngineOpts::default(),
    }
}

fn shared_stage(env: &Env, root: &Arc<Layer>) -> Arc<Stage> {
    env.cache
        .open(root, None, InitialLoadSet::LoadNone, ShareClass::Shared)
}

fn unshared_request() -> CompositionRequest {
    let mut req = CompositionRequest::for_file("");
    req.share_requested = false;
    req
}

#[test]
fn shared_request_exposes_the_resolved_stage() {
    let env = env();
    let root = env.cache.store().create_anonymous("root");
    let shared = shared_stage(&env, &root);
    let mut c = ShareModeController::new();
    let out = c.apply(
        &env.cache,
        &shared,
        &CompositionRequest::for_file(""),
        &NoLayerProvider,
        &env.opts,
    );
    assert!(Arc::ptr_eq(&out, &shared));
    assert!(c.wrapper_root().is_none());
}

#[test]
fn unshared_request_wraps_the_resolved_root() {
    let env = env();
    let root = env.cache.store().create_anonymous("root");
    root.set_fps(Some(30.0));
    root.set_tcps(Some(60.0));
    let shared = shared_stage(&env, &root);
    let mut c = ShareModeController::new();
    let req = unshared_request();

    let out = c.apply(&env.cache, &shared, &req, &NoLayerProvider, &env.opts);
    assert!(!Arc::ptr_eq(&out, &shared));
    let wrapper = c.wrapper_root().unwrap().clone();
    assert!(Arc::ptr_eq(out.root_layer(), &wrapper));
    assert_eq!(wrapper.tag(), "unshareableLayer");
    assert_eq!(wrapper.sublayers(), vec![root.identifier().to_string()]);
    assert_eq!(
        wrapper.custom_strings(REFERENCED_LAYERS_KEY),
        vec![root.identifier().to_string()]
    );
    assert!(Arc::ptr_eq(out.session_layer(), c.wrapper_session().unwrap()));
    assert!(out.has_layer(&root));
    assert_eq!(wrapper.fps(), Some(30.0));
    assert_eq!(out.frames_per_second(), Some(30.0));
    assert_eq!(out.time_codes_per_second(), Some(60.0));

    // Repeated resolutions find the same private stage.
    let again = c.apply(&env.cache, &shared, &req, &NoLayerProvider, &env.opts);
    assert!(Arc::ptr_eq(&again, &out));
}

#[test]
fn renamed_incoming_root_is_rewritten_not_duplicated() {
    let env = env();
    let store = env.cache.store().clone();
    let anon = store.create_anonymous("root");
    let shared = shared_stage(&env, &anon);
    let mut c = ShareModeController::new();
    let req = unshared_request();
    c.apply(&env.cache, &shared, &req, &NoLayerProvider, &env.opts);

    let saved = store.save_as(&anon, "/a.json").unwrap();
    let reopened = shared_stage(&env, &saved);
    let out = c.apply(&env.cache, &reopened, &req, &NoLayerProvider, &env.opts);

    let wrapper = c.wrapper_root().unwrap();
    assert_eq!(wrapper.sublayers(), vec!["/a.json".to_string()]);
    assert_eq!(
        wrapper.custom_strings(REFERENCED_LAYERS_KEY),
        vec!["/a.json".to_string()]
    );
    assert!(out.has_layer(&saved));
    assert!(env.source.contains("/a.json"));
}

#[test]
fn unrelated_incoming_root_is_appended() {
    let env = env();
    let store = env.cache.store().clone();
    let first = store.create_anonymous("first");
    let mut c = ShareModeController::new();
    let req = unshared_request();
    c.apply(&env.cache, &shared_stage(&env, &first), &req, &NoLayerProvider, &env.opts);

    // The old reference is gone from the sublayers, so the new one cannot be a rename of it.
    let wrapper = c.wrapper_root().unwrap().clone();
    wrapper.set_sublayers(vec![]);
    env.source.insert("/b.json", LayerContent::default());
    let second = store.find_or_open("/b.json").unwrap();
    c.apply(&env.cache, &shared_stage(&env, &second), &req, &NoLayerProvider, &env.opts);
    assert_eq!(wrapper.sublayers(), vec!["/b.json".to_string()]);
}

#[test]
fn shared_period_retains_the_wrapper_sublayers() {
    let env = env();
    let root = env.cache.store().create_anonymous("root");
    let shared = shared_stage(&env, &root);
    let mut c = ShareModeController::new();
    c.apply(&env.cache, &shared, &unshared_request(), &NoLayerProvider, &env.opts);
    c.apply(
        &env.cache,
        &shared,
        &CompositionRequest::for_file(""),
        &NoLayerProvider,
        &env.opts,
    );
    assert_eq!(c.retained_sublayers().len(), 1);
    assert!(Arc::ptr_eq(&c.retained_sublayers()[0], &root));
}

#[test]
fn persisted_wrapper_is_recovered_with_remapped_references() {
    let env = env();
    let store = env.cache.store().clone();
    let db = Arc::new(LayerDatabase::new(store.clone()));
    let root = store.create_anonymous("root");
    db.add_layer(root.clone(), "anon:old:root");
    let wrapper = store.create_anonymous("unshareableLayer");
    wrapper.set_custom_strings(REFERENCED_LAYERS_KEY, vec!["anon:old:root".to_string()]);
    wrapper.set_sublayers(vec![root.identifier().to_string()]);
    db.add_layer(wrapper.clone(), "anon:old:wrapper");
    let session = store.create_anonymous("session");
    db.add_layer(session.clone(), "anon:old:session");

    let mut req = unshared_request();
    req.root_layer_name = "anon:old:wrapper".to_string();
    req.session_layer_name = "anon:old:session".to_string();
    let provider = DatabaseLayerProvider::new(db);
    let mut c = ShareModeController::new();
    let out = c.apply(&env.cache, &shared_stage(&env, &root), &req, &provider, &env.opts);

    assert!(Arc::ptr_eq(out.root_layer(), &wrapper));
    assert!(Arc::ptr_eq(out.session_layer(), &session));
    assert_eq!(wrapper.sublayers(), vec![root.identifier().to_string()]);
    assert_eq!(
        wrapper.custom_strings(REFERENCED_LAYERS_KEY),
        vec![root.identifier().to_string()]
    );
}

#[test]
fn recovered_session_is_not_overwritten_on_first_resolution() {
    let env = env();
    let store = env.cache.store().clone();
    let db = Arc::new(LayerDatabase::new(store.clone()));
    let root = store.create_anonymous("root");
    let session = store.create_anonymous("session");
    session
        .define_prim(&PrimPath::parse("/Kept").unwrap(), "Xform")
        .unwrap();
    db.add_layer(session.clone(), "anon:old:session");

    let mut req = unshared_request();
    req.session_layer_name = "anon:old:session".to_string();
    let shared = shared_stage(&env, &root);
    let mut c = ShareModeController::new();
    c.apply(
        &env.cache,
        &shared,
        &req,
        &DatabaseLayerProvider::new(db),
        &env.opts,
    );
    let mut target = None;
    assert!(!c.update_share_mode(&store, &shared, ShareMode::Unshared, "session", &mut target));
    assert_eq!(c.mode(), ShareMode::Unshared);
    assert!(session.prim(&PrimPath::parse("/Kept").unwrap()).is_some());
}

#[test]
fn mode_transitions_move_session_content() {
    let env = env();
    let store = env.cache.store().clone();
    let root = store.create_anonymous("root");
    let shared = shared_stage(&env, &root);
    let p = PrimPath::parse("/Edit").unwrap();
    shared.session_layer().define_prim(&p, "Xform").unwrap();
    let original = shared.session_layer().digest();
    let mut c = ShareModeController::new();
    let mut target = None;

    // Unknown -> Shared moves nothing.
    assert!(!c.update_share_mode(&store, &shared, ShareMode::Shared, "session", &mut target));
    assert_eq!(c.mode(), ShareMode::Shared);

    c.apply(&env.cache, &shared, &unshared_request(), &NoLayerProvider, &env.opts);
    let mut target = Some(shared.session_layer().clone());
    assert!(c.update_share_mode(&store, &shared, ShareMode::Unshared, "session", &mut target));
    let private = c.wrapper_session().unwrap().clone();
    assert_eq!(private.digest(), original);
    assert!(Arc::ptr_eq(target.as_ref().unwrap(), &private));

    // Same mode again is a no-op.
    assert!(!c.update_share_mode(&store, &shared, ShareMode::Unshared, "session", &mut target));

    shared.session_layer().clear();
    assert!(c.update_share_mode(&store, &shared, ShareMode::Shared, "session", &mut target));
    assert_eq!(shared.session_layer().digest(), original);
    assert!(Arc::ptr_eq(target.as_ref().unwrap(), shared.session_layer()));
}

#[test]
fn first_unshared_resolution_copies_the_shared_session() {
    let env = env();
    let store = env.cache.store().clone();
    let root = store.create_anonymous("root");
    let shared = shared_stage(&env, &root);
    shared.session_layer().set_fps(Some(12.0));
    let mut c = ShareModeController::new();
    c.apply(&env.cache, &shared, &unshared_request(), &NoLayerProvider, &env.opts);
    assert!(c.update_share_mode(&store, &shared, ShareMode::Unshared, "session", &mut None));
    assert_eq!(c.wrapper_session().unwrap().fps(), Some(12.0));
}

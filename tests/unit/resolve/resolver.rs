use super::*;

use crate::layer::database::LayerDatabase;
use crate::layer::model::LayerContent;
use crate::layer::source::MemorySource;
use crate::layer::store::LayerStore;
use crate::resolve::host::{DatabaseLayerProvider, DefaultHost, NoLayerProvider};
use crate::resolve::request::IncomingStage;
use crate::stage::cache::CacheId;

struct Env {
    source: Arc<MemorySource>,
    cache: Arc<StageCache>,
    host: Arc<DefaultHost>,
}

fn env() -> Env {
    let source = Arc::new(MemorySource::new());
    let store = Arc::new(LayerStore::new(source.clone()));
    Env {
        source,
        cache: Arc::new(StageCache::new(store)),
        host: Arc::new(DefaultHost::new()),
    }
}

fn resolver(env: &Env) -> StageResolver {
    StageResolver::new(
        env.cache.clone(),
        env.host.clone(),
        Arc::new(NoLayerProvider),
        EngineOpts::default(),
    )
}

#[test]
fn empty_path_resolves_to_a_new_anonymous_stage() {
    let env = env();
    let mut r = resolver(&env);
    let resolved = r.resolve(&CompositionRequest::for_file("")).unwrap();
    let root = resolved.stage.root_layer();
    assert!(root.is_anonymous());
    assert!(resolved.stage.session_layer().is_anonymous());
    assert!(root.sublayers().is_empty());
    assert_eq!(resolved.prim_path, PrimPath::absolute_root());
    assert!(Arc::ptr_eq(&resolved.stage.edit_target(), root));
    assert!(!resolved.is_incoming);
    assert!(resolved.file_path.is_none());

    // The anonymous root is reused, so the same stage comes back.
    let again = r.resolve(&CompositionRequest::for_file("  ")).unwrap();
    assert!(Arc::ptr_eq(&again.stage, &resolved.stage));
}

#[test]
fn same_file_resolves_to_the_same_stage_across_consumers() {
    let env = env();
    env.source.insert("/a.json", LayerContent::default());
    let a = resolver(&env)
        .resolve(&CompositionRequest::for_file("/a.json"))
        .unwrap();
    let b = resolver(&env)
        .resolve(&CompositionRequest::for_file(" /a.json "))
        .unwrap();
    assert!(Arc::ptr_eq(&a.stage, &b.stage));
    assert_eq!(a.stage.root_layer().identifier(), "/a.json");
}

#[test]
fn missing_file_degrades_to_an_anonymous_root() {
    let env = env();
    let resolved = resolver(&env)
        .resolve(&CompositionRequest::for_file("/missing.json"))
        .unwrap();
    assert!(resolved.stage.root_layer().is_anonymous());
}

#[test]
fn relative_paths_resolve_against_the_document() {
    let mut env = env();
    env.host = Arc::new(DefaultHost::with_document_dir("/docs"));
    let full = std::path::Path::new("/docs")
        .join("shot.json")
        .to_string_lossy()
        .into_owned();
    env.source.insert(full.clone(), LayerContent::default());
    let resolved = resolver(&env)
        .resolve(&CompositionRequest::for_file("shot.json"))
        .unwrap();
    assert_eq!(resolved.stage.root_layer().identifier(), full);
}

#[test]
fn read_only_root_targets_the_session_layer() {
    let env = env();
    env.source
        .insert_read_only("/ro.json", LayerContent::default());
    let resolved = resolver(&env)
        .resolve(&CompositionRequest::for_file("/ro.json"))
        .unwrap();
    assert!(Arc::ptr_eq(
        &resolved.stage.edit_target(),
        resolved.stage.session_layer()
    ));
}

#[test]
fn host_policy_targets_the_session_layer() {
    let env = env();
    let opts = EngineOpts {
        target_session_on_open: true,
        ..EngineOpts::default()
    };
    let mut r = StageResolver::new(
        env.cache.clone(),
        env.host.clone(),
        Arc::new(NoLayerProvider),
        opts,
    );
    let resolved = r.resolve(&CompositionRequest::for_file("")).unwrap();
    assert!(Arc::ptr_eq(
        &resolved.stage.edit_target(),
        resolved.stage.session_layer()
    ));
}

#[test]
fn incoming_stage_wins_and_constrains_the_prim_path() {
    let env = env();
    let upstream = resolver(&env)
        .resolve(&CompositionRequest::for_file(""))
        .unwrap()
        .stage;
    let mut req = CompositionRequest::for_file("/ignored.json");
    req.incoming = Some(IncomingStage {
        stage: upstream.clone(),
        prim_path: PrimPath::parse("/World").unwrap(),
    });

    let resolved = resolver(&env).resolve(&req).unwrap();
    assert!(Arc::ptr_eq(&resolved.stage, &upstream));
    assert!(resolved.is_incoming);
    assert_eq!(resolved.prim_path.as_str(), "/World");

    req.prim_path = PrimPath::parse("/World/Geo").unwrap();
    assert_eq!(
        resolver(&env).resolve(&req).unwrap().prim_path.as_str(),
        "/World/Geo"
    );

    req.prim_path = PrimPath::parse("/Other").unwrap();
    let err = resolver(&env).resolve(&req).unwrap_err();
    assert!(matches!(err, StageError::Validation(_)));
}

#[test]
fn malformed_prim_path_fails_validation() {
    let env = env();
    let mut req = CompositionRequest::for_file("");
    req.prim_path = PrimPath::empty();
    assert!(matches!(
        resolver(&env).resolve(&req),
        Err(StageError::Validation(_))
    ));
}

#[test]
fn cache_handle_beats_the_file_path() {
    let env = env();
    env.source.insert("/cached.json", LayerContent::default());
    let cached = resolver(&env)
        .resolve(&CompositionRequest::for_file("/cached.json"))
        .unwrap()
        .stage;
    let id = env.cache.insert(&cached);

    let mut req = CompositionRequest::for_file("/elsewhere.json");
    req.cache_handle = id;
    let resolved = resolver(&env).resolve(&req).unwrap();
    assert!(Arc::ptr_eq(&resolved.stage, &cached));
    assert!(!resolved.is_incoming);
    assert_eq!(resolved.file_path.as_deref(), Some("/cached.json"));

    env.host.mark_consumed(id);
    assert!(resolver(&env).resolve(&req).unwrap().is_incoming);

    req.cache_handle = CacheId::from_raw(99);
    let fallback = resolver(&env).resolve(&req).unwrap();
    assert!(!Arc::ptr_eq(&fallback.stage, &cached));
}

#[test]
fn reloaded_anonymous_root_is_re_anchored() {
    let env = env();
    let store = env.cache.store().clone();
    let db = Arc::new(LayerDatabase::new(store.clone()));
    let reloaded = store.create_anonymous("anonymousLayer");
    db.add_layer(reloaded.clone(), "anon:dead:anonymousLayer");
    let mut r = StageResolver::new(
        env.cache.clone(),
        env.host.clone(),
        Arc::new(DatabaseLayerProvider::new(db)),
        EngineOpts::default(),
    );

    let resolved = r
        .resolve(&CompositionRequest::for_file("anon:dead:anonymousLayer"))
        .unwrap();
    assert!(Arc::ptr_eq(resolved.stage.root_layer(), &reloaded));
    assert_eq!(resolved.file_path.as_deref(), Some(reloaded.identifier()));
    assert!(Arc::ptr_eq(r.anonymous_root().unwrap(), &reloaded));
}

#[test]
fn persisted_root_and_session_are_preferred_when_shared() {
    let env = env();
    env.source.insert("/a.json", LayerContent::default());
    let store = env.cache.store().clone();
    let db = Arc::new(LayerDatabase::new(store.clone()));
    let root = store.create_anonymous("anonymousLayer");
    let session = store.create_anonymous("session");
    db.add_layer(root.clone(), "anon:r");
    db.add_layer(session.clone(), "anon:s");
    let mut r = StageResolver::new(
        env.cache.clone(),
        env.host.clone(),
        Arc::new(DatabaseLayerProvider::new(db)),
        EngineOpts::default(),
    );
    let mut req = CompositionRequest::for_file("/a.json");
    req.root_layer_name = "anon:r".to_string();
    req.session_layer_name = "anon:s".to_string();

    let resolved = r.resolve(&req).unwrap();
    assert!(Arc::ptr_eq(resolved.stage.root_layer(), &root));
    assert!(Arc::ptr_eq(resolved.stage.session_layer(), &session));

    req.share_requested = false;
    let unshared = r.resolve(&req).unwrap();
    assert_eq!(unshared.stage.root_layer().identifier(), "/a.json");
}

#[test]
fn variant_fallbacks_are_recorded_on_new_stages() {
    let env = env();
    let mut req = CompositionRequest::for_file("");
    req.variant_fallbacks = [("look".to_string(), vec!["red".to_string()])].into();
    let resolved = resolver(&env).resolve(&req).unwrap();
    assert_eq!(resolved.stage.variant_fallbacks(), req.variant_fallbacks);
}

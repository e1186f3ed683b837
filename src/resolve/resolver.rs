use std::sync::Arc;

use crate::foundation::core::PrimPath;
use crate::foundation::error::{StageError, StageResult};
use crate::layer::model::{Layer, is_anonymous_identifier};
use crate::resolve::host::{HostContext, LayerProvider};
use crate::resolve::request::{CompositionRequest, EngineOpts};
use crate::stage::cache::{ShareClass, StageCache};
use crate::stage::composed::Stage;

#[derive(Clone, Debug)]
/// Outcome of a successful resolution.
pub struct ResolvedStage {
    /// The resolved (shared-candidate) stage.
    pub stage: Arc<Stage>,
    /// Prim path exposed by the consumer.
    pub prim_path: PrimPath,
    /// Prim path the upstream producer exposed; empty when not incoming.
    pub incoming_prim_path: PrimPath,
    /// Whether the stage was handed over rather than opened by this consumer.
    pub is_incoming: bool,
    /// Replacement for the request's file path, when the resolved root no longer matches it.
    pub file_path: Option<String>,
}

/// Turns [`CompositionRequest`]s into stages.
///
/// Sources are consulted in order: the incoming stage, the cache handle, the file path. The
/// resolver remembers the anonymous root it created so that a consumer without a file keeps
/// resolving to the same empty stage.
pub struct StageResolver {
    cache: Arc<StageCache>,
    host: Arc<dyn HostContext>,
    provider: Arc<dyn LayerProvider>,
    opts: EngineOpts,
    anonymous_root: Option<Arc<Layer>>,
}

impl std::fmt::Debug for StageResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageResolver")
            .field("opts", &self.opts)
            .field(
                "anonymous_root",
                &self.anonymous_root.as_ref().map(|l| l.identifier()),
            )
            .finish_non_exhaustive()
    }
}

impl StageResolver {
    /// Create a resolver.
    pub fn new(
        cache: Arc<StageCache>,
        host: Arc<dyn HostContext>,
        provider: Arc<dyn LayerProvider>,
        opts: EngineOpts,
    ) -> Self {
        Self {
            cache,
            host,
            provider,
            opts,
            anonymous_root: None,
        }
    }

    /// The stage cache.
    pub fn cache(&self) -> &Arc<StageCache> {
        &self.cache
    }

    /// The host context.
    pub fn host(&self) -> &Arc<dyn HostContext> {
        &self.host
    }

    /// The layer provider.
    pub fn provider(&self) -> &Arc<dyn LayerProvider> {
        &self.provider
    }

    /// Engine options.
    pub fn opts(&self) -> &EngineOpts {
        &self.opts
    }

    /// Anonymous root created (or re-anchored) by this resolver.
    pub fn anonymous_root(&self) -> Option<&Arc<Layer>> {
        self.anonymous_root.as_ref()
    }

    /// Replace the tracked anonymous root.
    pub fn set_anonymous_root(&mut self, layer: Option<Arc<Layer>>) {
        self.anonymous_root = layer;
    }

    /// Resolve `req`.
    ///
    /// Fails with a validation error when the requested prim path is malformed or not beneath
    /// the incoming stage's prim path. Unreadable files degrade to an anonymous root.
    #[tracing::instrument(skip_all, fields(file = %req.file_path, prim = %req.prim_path))]
    pub fn resolve(&mut self, req: &CompositionRequest) -> StageResult<ResolvedStage> {
        if req.prim_path.is_empty() || req.prim_path.is_property_path() {
            return Err(StageError::validation(format!(
                "'{}' is not a valid prim path",
                req.prim_path
            )));
        }

        if let Some(incoming) = &req.incoming {
            let prim_path = exposed_prim_path(&req.prim_path, &incoming.prim_path)?;
            tracing::debug!(
                root = incoming.stage.root_layer().identifier(),
                "using incoming stage"
            );
            return Ok(ResolvedStage {
                stage: incoming.stage.clone(),
                prim_path,
                incoming_prim_path: incoming.prim_path.clone(),
                is_incoming: true,
                file_path: None,
            });
        }

        if req.cache_handle.is_valid() {
            if let Some(stage) = self.cache.find_by_id(req.cache_handle) {
                let is_incoming = self.host.is_cache_entry_consumed(req.cache_handle);
                let root = stage.root_layer();
                let file_path = (!root.is_anonymous() && root.identifier() != req.file_path)
                    .then(|| root.identifier().to_string());
                tracing::debug!(
                    handle = req.cache_handle.as_raw(),
                    root = root.identifier(),
                    is_incoming,
                    "using cached stage"
                );
                return Ok(ResolvedStage {
                    stage,
                    prim_path: req.prim_path.clone(),
                    incoming_prim_path: PrimPath::empty(),
                    is_incoming,
                    file_path,
                });
            }
            tracing::debug!(
                handle = req.cache_handle.as_raw(),
                "cache handle not registered, resolving the file path"
            );
        }

        self.resolve_file(req)
    }

    fn resolve_file(&mut self, req: &CompositionRequest) -> StageResult<ResolvedStage> {
        let trimmed = req.file_path.trim();
        let path = if trimmed.is_empty() || is_anonymous_identifier(trimmed) {
            trimmed.to_string()
        } else {
            self.host.resolve_path(trimmed)
        };

        let mut root = None;
        if req.share_requested
            && let Some(layer) = self.provider.compute_root_layer(&req.root_layer_name)
        {
            if layer.is_anonymous() {
                self.anonymous_root = Some(layer.clone());
            }
            root = Some(layer);
        }
        if root.is_none() && !path.is_empty() {
            root = self.open_root(&path);
        }
        let root = match root {
            Some(root) => root,
            None => self.anonymous_root_layer(),
        };
        let file_path = (is_anonymous_identifier(&path) && root.identifier() != path)
            .then(|| root.identifier().to_string());

        let session = if req.share_requested {
            self.provider.compute_session_layer(&req.session_layer_name)
        } else {
            None
        };
        let stage = self.cache.open(
            &root,
            session.as_ref(),
            self.opts.initial_load_set,
            ShareClass::Shared,
        );

        let target_session = self.opts.target_session_on_open || !root.permission_to_edit();
        if target_session
            && Arc::ptr_eq(&stage.edit_target(), stage.root_layer())
            && let Err(e) = stage.set_edit_target(stage.session_layer())
        {
            tracing::warn!(error = %e, "session layer not targeted");
        }
        if !req.variant_fallbacks.is_empty() && stage.variant_fallbacks().is_empty() {
            stage.set_variant_fallbacks(req.variant_fallbacks.clone());
        }

        tracing::debug!(
            path = %path,
            root = root.identifier(),
            session = stage.session_layer().identifier(),
            "resolved stage"
        );
        Ok(ResolvedStage {
            stage,
            prim_path: req.prim_path.clone(),
            incoming_prim_path: PrimPath::empty(),
            is_incoming: false,
            file_path,
        })
    }

    fn open_root(&mut self, path: &str) -> Option<Arc<Layer>> {
        let store = self.cache.store();
        if is_anonymous_identifier(path) {
            if let Some(layer) = store.find(path) {
                return Some(layer);
            }
            // Anonymous layers reload under a new identifier.
            let layer = self.provider.find_persisted(path)?;
            tracing::debug!(
                from = path,
                to = layer.identifier(),
                "re-anchored anonymous root"
            );
            if layer.is_anonymous() {
                self.anonymous_root = Some(layer.clone());
            }
            return Some(layer);
        }
        match store.find_or_open(path) {
            Ok(layer) => Some(layer),
            Err(e) => {
                tracing::warn!(path, error = %e, "root layer not opened, using an anonymous root");
                None
            }
        }
    }

    fn anonymous_root_layer(&mut self) -> Arc<Layer> {
        let store = self.cache.store();
        let tag = &self.opts.anonymous_root_tag;
        self.anonymous_root
            .get_or_insert_with(|| store.create_anonymous(tag))
            .clone()
    }
}

fn exposed_prim_path(requested: &PrimPath, upstream: &PrimPath) -> StageResult<PrimPath> {
    if upstream.is_empty() || upstream.is_absolute_root() {
        return Ok(requested.clone());
    }
    if requested.is_absolute_root() {
        return Ok(upstream.clone());
    }
    if requested.has_prefix(upstream) {
        return Ok(requested.clone());
    }
    Err(StageError::validation(format!(
        "prim path '{requested}' is not beneath the incoming prim path '{upstream}'"
    )))
}

#[cfg(test)]
#[path = "../../tests/unit/resolve/resolver.rs"]
mod tests;

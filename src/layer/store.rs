use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::foundation::error::{StageError, StageResult};
use crate::layer::model::{ANONYMOUS_PREFIX, Layer, LayerContent, is_anonymous_identifier};
use crate::layer::source::LayerSource;

/// Ownership-free registry of live layers by identifier.
///
/// The store only holds weak references; layers live as long as a stage, a layer database or a
/// caller holds them. File-backed layers are opened through the injected [`LayerSource`].
pub struct LayerStore {
    layers: Mutex<HashMap<String, Weak<Layer>>>,
    next_anon: AtomicU64,
    source: Arc<dyn LayerSource>,
}

impl std::fmt::Debug for LayerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerStore")
            .field("live", &self.live_count())
            .finish_non_exhaustive()
    }
}

impl LayerStore {
    /// Create a store reading file-backed layers from `source`.
    pub fn new(source: Arc<dyn LayerSource>) -> Self {
        Self {
            layers: Mutex::new(HashMap::new()),
            next_anon: AtomicU64::new(1),
            source,
        }
    }

    /// The underlying layer source.
    pub fn source(&self) -> &Arc<dyn LayerSource> {
        &self.source
    }

    /// Create a new empty anonymous layer tagged `tag`.
    pub fn create_anonymous(&self, tag: &str) -> Arc<Layer> {
        self.create_anonymous_with(tag, LayerContent::default())
    }

    /// Create a new anonymous layer tagged `tag` holding `content`.
    pub fn create_anonymous_with(&self, tag: &str, content: LayerContent) -> Arc<Layer> {
        let n = self.next_anon.fetch_add(1, Ordering::Relaxed);
        let identifier = format!("{ANONYMOUS_PREFIX}{n:x}:{tag}");
        let layer = Layer::new(identifier.clone(), tag.to_string(), content, true);
        self.layers.lock().insert(identifier, Arc::downgrade(&layer));
        tracing::trace!(identifier = layer.identifier(), "created anonymous layer");
        layer
    }

    /// Find a live layer by identifier.
    pub fn find(&self, identifier: &str) -> Option<Arc<Layer>> {
        let mut layers = self.layers.lock();
        match layers.get(identifier).and_then(Weak::upgrade) {
            Some(l) => Some(l),
            None => {
                layers.remove(identifier);
                None
            }
        }
    }

    /// Find a live layer or open it from the source.
    ///
    /// Anonymous identifiers are never opened: a dead anonymous layer is gone for good.
    pub fn find_or_open(&self, identifier: &str) -> StageResult<Arc<Layer>> {
        if let Some(layer) = self.find(identifier) {
            return Ok(layer);
        }
        if identifier.is_empty() {
            return Err(StageError::io("cannot open a layer with an empty identifier"));
        }
        if is_anonymous_identifier(identifier) {
            return Err(StageError::io(format!(
                "anonymous layer '{identifier}' is no longer alive"
            )));
        }
        let Some(content) = self.source.read(identifier)? else {
            return Err(StageError::io(format!("layer '{identifier}' not found")));
        };
        let writable = self.source.is_writable(identifier);
        Ok(self.register_opened(identifier, content, writable))
    }

    fn register_opened(
        &self,
        identifier: &str,
        content: LayerContent,
        writable: bool,
    ) -> Arc<Layer> {
        let mut layers = self.layers.lock();
        // Another thread may have opened the same identifier meanwhile.
        if let Some(existing) = layers.get(identifier).and_then(Weak::upgrade) {
            return existing;
        }
        let tag = std::path::Path::new(identifier)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| identifier.to_string());
        let layer = Layer::new(identifier.to_string(), tag, content, writable);
        layers.insert(identifier.to_string(), Arc::downgrade(&layer));
        tracing::debug!(identifier, "opened layer");
        layer
    }

    /// Write a file-backed layer back to its source.
    pub fn save(&self, layer: &Layer) -> StageResult<()> {
        if layer.is_anonymous() {
            return Err(StageError::validation(format!(
                "anonymous layer '{}' has no file to save to",
                layer.identifier()
            )));
        }
        if !layer.permission_to_save() {
            return Err(StageError::validation(format!(
                "layer '{}' does not allow saving",
                layer.identifier()
            )));
        }
        self.source.write(layer.identifier(), &layer.content())?;
        layer.mark_clean();
        Ok(())
    }

    /// Export `layer` to `identifier` and return the file-backed layer opened from it.
    ///
    /// When a layer is already live under `identifier`, its content is replaced and that layer is
    /// returned.
    pub fn save_as(&self, layer: &Layer, identifier: &str) -> StageResult<Arc<Layer>> {
        if is_anonymous_identifier(identifier) || identifier.is_empty() {
            return Err(StageError::validation(format!(
                "cannot save layer to '{identifier}'"
            )));
        }
        let content = layer.content();
        self.source.write(identifier, &content)?;
        if let Some(existing) = self.find(identifier) {
            existing.replace_content(content);
            existing.mark_clean();
            return Ok(existing);
        }
        let writable = self.source.is_writable(identifier);
        tracing::debug!(from = layer.identifier(), to = identifier, "saved layer as");
        Ok(self.register_opened(identifier, content, writable))
    }

    /// Number of layers currently alive.
    pub fn live_count(&self) -> usize {
        self.layers
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
#[path = "../../tests/unit/layer/store.rs"]
mod tests;

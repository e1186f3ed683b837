use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;

use crate::foundation::error::{StageError, StageResult};
use crate::layer::model::LayerContent;

/// Capability to open/parse and export layers by identifier.
pub trait LayerSource: Send + Sync {
    /// Read the content stored under `identifier`, or `None` when nothing is stored there.
    fn read(&self, identifier: &str) -> StageResult<Option<LayerContent>>;

    /// Store `content` under `identifier`.
    fn write(&self, identifier: &str, content: &LayerContent) -> StageResult<()>;

    /// Whether layers opened from `identifier` may be edited.
    fn is_writable(&self, _identifier: &str) -> bool {
        true
    }
}

#[derive(Default)]
/// In-memory layer source, keyed by identifier.
pub struct MemorySource {
    entries: Mutex<HashMap<String, (LayerContent, bool)>>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store editable content under `identifier`.
    pub fn insert(&self, identifier: impl Into<String>, content: LayerContent) {
        self.entries.lock().insert(identifier.into(), (content, true));
    }

    /// Store content whose layers deny edit permission when opened.
    pub fn insert_read_only(&self, identifier: impl Into<String>, content: LayerContent) {
        self.entries
            .lock()
            .insert(identifier.into(), (content, false));
    }

    /// Return `true` when something is stored under `identifier`.
    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.lock().contains_key(identifier)
    }
}

impl LayerSource for MemorySource {
    fn read(&self, identifier: &str) -> StageResult<Option<LayerContent>> {
        Ok(self.entries.lock().get(identifier).map(|(c, _)| c.clone()))
    }

    fn write(&self, identifier: &str, content: &LayerContent) -> StageResult<()> {
        let mut entries = self.entries.lock();
        let writable = entries.get(identifier).is_none_or(|(_, w)| *w);
        entries.insert(identifier.to_string(), (content.clone(), writable));
        Ok(())
    }

    fn is_writable(&self, identifier: &str) -> bool {
        self.entries
            .lock()
            .get(identifier)
            .is_none_or(|(_, w)| *w)
    }
}

#[derive(Clone, Copy, Debug, Default)]
/// Layer source reading and writing JSON files; the identifier is the file path.
pub struct JsonFileSource;

impl LayerSource for JsonFileSource {
    fn read(&self, identifier: &str) -> StageResult<Option<LayerContent>> {
        let path = Path::new(identifier);
        if !path.is_file() {
            return Ok(None);
        }
        let f = std::fs::File::open(path)
            .map_err(|e| StageError::io(format!("open layer '{identifier}': {e}")))?;
        let r = std::io::BufReader::new(f);
        let content: LayerContent = serde_json::from_reader(r)
            .map_err(|e| StageError::serde(format!("parse layer '{identifier}': {e}")))?;
        Ok(Some(content))
    }

    fn write(&self, identifier: &str, content: &LayerContent) -> StageResult<()> {
        let path = Path::new(identifier);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StageError::io(format!("create '{}': {e}", parent.display())))?;
        }
        let f = std::fs::File::create(path)
            .map_err(|e| StageError::io(format!("create layer '{identifier}': {e}")))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(f), content)
            .map_err(|e| StageError::serde(format!("write layer '{identifier}': {e}")))?;
        Ok(())
    }

    fn is_writable(&self, identifier: &str) -> bool {
        std::fs::metadata(identifier).map_or(true, |m| !m.permissions().readonly())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/layer/source.rs"]
mod tests;

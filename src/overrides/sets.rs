use std::collections::{BTreeMap, BTreeSet};

use crate::stage::load_rules::LoadRules;

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
/// Per-consumer overrides persisted by the host and synchronized onto the exposed stage.
pub struct OverrideSets {
    /// Explicit payload rules. `None` means "derive from the load-payloads flag".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_rules: Option<LoadRules>,
    /// Muted layer identifiers.
    #[serde(default)]
    pub muted_layers: BTreeSet<String>,
    /// Locked layer identifiers.
    #[serde(default)]
    pub locked_layers: BTreeSet<String>,
    /// Identifier of the persisted edit target layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_target: Option<String>,
}

impl OverrideSets {
    /// Record `identifier` as muted. Returns `false` when it already was.
    pub fn mute(&mut self, identifier: &str) -> bool {
        self.muted_layers.insert(identifier.to_string())
    }

    /// Forget the mute of `identifier`. Returns `false` when it was not muted.
    pub fn unmute(&mut self, identifier: &str) -> bool {
        self.muted_layers.remove(identifier)
    }

    /// Record `identifier` as locked. Returns `false` when it already was.
    pub fn lock(&mut self, identifier: &str) -> bool {
        self.locked_layers.insert(identifier.to_string())
    }

    /// Forget the lock of `identifier`. Returns `false` when it was not locked.
    pub fn unlock(&mut self, identifier: &str) -> bool {
        self.locked_layers.remove(identifier)
    }

    /// Replace the muted set. Returns `true` when it changed.
    pub fn set_muted_layers(&mut self, muted: impl IntoIterator<Item = String>) -> bool {
        let muted: BTreeSet<String> = muted.into_iter().collect();
        if muted == self.muted_layers {
            return false;
        }
        self.muted_layers = muted;
        true
    }

    /// Rewrite every identifier through `rename` (old identifier to current identifier).
    pub fn rename_layers(&mut self, rename: &BTreeMap<String, String>) {
        let map = |set: &BTreeSet<String>| -> BTreeSet<String> {
            set.iter()
                .map(|id| rename.get(id).cloned().unwrap_or_else(|| id.clone()))
                .collect()
        };
        self.muted_layers = map(&self.muted_layers);
        self.locked_layers = map(&self.locked_layers);
        if let Some(target) = &mut self.edit_target
            && let Some(new) = rename.get(target.as_str())
        {
            *target = new.clone();
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/overrides/sets.rs"]
mod tests;

use crate::foundation::core::PrimPath;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
/// Payload loading policy attached to a prim path.
pub enum LoadRule {
    /// Load the prim's payload only; descendants follow their own rules.
    Load,
    /// Unload the prim's payload and everything beneath it.
    Unload,
    /// Load the prim's payload and every descendant payload.
    LoadWithDescendants,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
/// Payload set requested when a stage is first opened.
pub enum InitialLoadSet {
    /// Load every payload.
    LoadAll,
    /// Load no payload.
    LoadNone,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
/// Ordered per-prim load rule table.
///
/// An empty table loads everything. Rules are kept sorted by path, one rule per path.
pub struct LoadRules {
    rules: Vec<(PrimPath, LoadRule)>,
}

impl LoadRules {
    /// Rule table that loads everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Rule table that loads nothing.
    pub fn none() -> Self {
        let mut r = Self::default();
        r.load_none();
        r
    }

    /// Rule table equivalent to `set`.
    pub fn for_initial_set(set: InitialLoadSet) -> Self {
        match set {
            InitialLoadSet::LoadAll => Self::all(),
            InitialLoadSet::LoadNone => Self::none(),
        }
    }

    /// Build a table from explicit rules. Later duplicates win.
    pub fn from_rules(rules: impl IntoIterator<Item = (PrimPath, LoadRule)>) -> Self {
        let mut out = Self::default();
        for (p, r) in rules {
            out.add_rule(p, r);
        }
        out
    }

    /// Explicit rules, sorted by path.
    pub fn rules(&self) -> &[(PrimPath, LoadRule)] {
        &self.rules
    }

    /// Replace every rule.
    pub fn set_rules(&mut self, rules: impl IntoIterator<Item = (PrimPath, LoadRule)>) {
        *self = Self::from_rules(rules);
    }

    /// Load everything.
    pub fn load_all(&mut self) {
        self.rules.clear();
    }

    /// Load nothing.
    pub fn load_none(&mut self) {
        self.rules = vec![(PrimPath::absolute_root(), LoadRule::Unload)];
    }

    /// Set the rule for `path`, replacing any rule already there.
    pub fn add_rule(&mut self, path: PrimPath, rule: LoadRule) {
        match self.rules.binary_search_by(|(p, _)| p.cmp(&path)) {
            Ok(i) => self.rules[i].1 = rule,
            Err(i) => self.rules.insert(i, (path, rule)),
        }
    }

    /// Load `path`, its ancestors and all of its descendants.
    pub fn load_with_descendants(&mut self, path: &PrimPath) {
        self.rules.retain(|(p, _)| !p.has_prefix(path));
        self.add_rule(path.clone(), LoadRule::LoadWithDescendants);
    }

    /// Unload `path` and all of its descendants.
    pub fn unload(&mut self, path: &PrimPath) {
        self.rules.retain(|(p, _)| !p.has_prefix(path));
        self.add_rule(path.clone(), LoadRule::Unload);
    }

    /// Effective rule for `path`.
    ///
    /// The closest ancestor-or-self rule decides `LoadWithDescendants`; a `Load` rule on the path
    /// itself yields `Load`; otherwise any loading rule strictly beneath the path yields `Load`
    /// (the path must be loaded to reach it); else `Unload`.
    pub fn effective_rule(&self, path: &PrimPath) -> LoadRule {
        let closest = self
            .rules
            .iter()
            .filter(|(p, _)| path.has_prefix(p))
            .max_by_key(|(p, _)| p.as_str().len());
        match closest {
            None | Some((_, LoadRule::LoadWithDescendants)) => {
                return LoadRule::LoadWithDescendants;
            }
            Some((p, LoadRule::Load)) if p == path => return LoadRule::Load,
            _ => {}
        }
        let descendant_loads = self
            .rules
            .iter()
            .any(|(p, r)| p != path && p.has_prefix(path) && *r != LoadRule::Unload);
        if descendant_loads {
            LoadRule::Load
        } else {
            LoadRule::Unload
        }
    }

    /// Return `true` when the payload at `path` is loaded.
    pub fn is_loaded(&self, path: &PrimPath) -> bool {
        self.effective_rule(path) != LoadRule::Unload
    }

    fn has_rules_under(&self, path: &PrimPath) -> bool {
        self.rules.iter().any(|(p, _)| p.has_prefix(path))
    }

    fn copy_rules(&mut self, from: &PrimPath, to: &PrimPath) {
        let desired = self.effective_rule(from);
        let snapshot = self.rules.clone();
        for (p, r) in snapshot {
            if let Some(dest) = p.replace_prefix(from, to) {
                self.add_rule(dest, r);
            }
        }
        if self.effective_rule(to) != desired {
            self.add_rule(to.clone(), desired);
        }
    }

    /// Reproduce the rules governing `from` (its own, its descendants', or the inherited one) at
    /// `to`. Returns `false` when nothing had to change.
    pub fn duplicate_rules(&mut self, from: &PrimPath, to: &PrimPath) -> bool {
        if !self.has_rules_under(from) && self.effective_rule(from) == self.effective_rule(to) {
            return false;
        }
        let before = self.clone();
        self.copy_rules(from, to);
        *self != before
    }

    /// Like [`LoadRules::duplicate_rules`], then drop the rules at and beneath `from`.
    pub fn move_rules(&mut self, from: &PrimPath, to: &PrimPath) -> bool {
        if !self.has_rules_under(from) && self.effective_rule(from) == self.effective_rule(to) {
            return false;
        }
        let before = self.clone();
        self.copy_rules(from, to);
        self.rules.retain(|(p, _)| !p.has_prefix(from));
        *self != before
    }

    /// Drop the rules at and beneath `path`. Returns `false` when there were none.
    pub fn remove_rules_for_path(&mut self, path: &PrimPath) -> bool {
        if !self.has_rules_under(path) {
            return false;
        }
        self.rules.retain(|(p, _)| !p.has_prefix(path));
        true
    }
}

#[cfg(test)]
#[path = "../../tests/unit/stage/load_rules.rs"]
mod tests;

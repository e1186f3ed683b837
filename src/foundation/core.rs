use std::cmp::Ordering;
use std::fmt;

use crate::foundation::error::{StageError, StageResult};

/// Scene path addressing a prim or a prim property.
///
/// Four shapes are valid: the empty path, the absolute root `/`, a prim path such as `/World/Geo`
/// and a property path such as `/World/Geo.xformOp:translate`. The empty path is used as the
/// "invalid / not set" marker, mirroring how hosts report unparsable prim paths.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrimPath(String);

impl PrimPath {
    /// The empty (invalid) path.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// The absolute root path `/`.
    pub fn absolute_root() -> Self {
        Self("/".to_string())
    }

    /// Parse and validate an absolute prim or property path.
    pub fn parse(s: &str) -> StageResult<Self> {
        if s.is_empty() {
            return Ok(Self::empty());
        }
        if s == "/" {
            return Ok(Self::absolute_root());
        }
        let Some(rest) = s.strip_prefix('/') else {
            return Err(StageError::validation(format!(
                "prim path '{s}' must be absolute"
            )));
        };

        let (prim_part, prop) = match rest.split_once('.') {
            Some((p, prop)) => (p, Some(prop)),
            None => (rest, None),
        };
        for seg in prim_part.split('/') {
            if !is_identifier(seg) {
                return Err(StageError::validation(format!(
                    "prim path '{s}' has invalid segment '{seg}'"
                )));
            }
        }
        if let Some(prop) = prop
            && (prop.is_empty() || !prop.split(':').all(is_identifier))
        {
            return Err(StageError::validation(format!(
                "prim path '{s}' has invalid property name '{prop}'"
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return `true` for the empty path.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return `true` for `/`.
    pub fn is_absolute_root(&self) -> bool {
        self.0 == "/"
    }

    /// Return `true` for `/` or a prim path (not a property path, not empty).
    pub fn is_absolute_root_or_prim_path(&self) -> bool {
        !self.is_empty() && !self.is_property_path()
    }

    /// Return `true` when the path names a property.
    pub fn is_property_path(&self) -> bool {
        self.0.contains('.')
    }

    /// Strip the property part, if any.
    pub fn prim_path(&self) -> PrimPath {
        match self.0.split_once('.') {
            Some((p, _)) => Self(p.to_string()),
            None => self.clone(),
        }
    }

    /// Final name element: the property name for property paths, the prim name otherwise.
    pub fn name(&self) -> &str {
        if let Some((_, prop)) = self.0.split_once('.') {
            return prop;
        }
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Parent path. The parent of a property path is its prim; `/` and empty have no parent.
    pub fn parent(&self) -> Option<PrimPath> {
        if self.is_empty() || self.is_absolute_root() {
            return None;
        }
        if self.is_property_path() {
            return Some(self.prim_path());
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::absolute_root()),
            Some(i) => Some(Self(self.0[..i].to_string())),
            None => None,
        }
    }

    /// Iterate this path and all of its ancestors up to (and including) `/`.
    pub fn ancestors_inclusive(&self) -> impl Iterator<Item = PrimPath> + '_ {
        std::iter::successors(
            if self.is_empty() {
                None
            } else {
                Some(self.clone())
            },
            |p| p.parent(),
        )
    }

    /// Return `true` when `prefix` is this path or one of its ancestors.
    pub fn has_prefix(&self, prefix: &PrimPath) -> bool {
        if prefix.is_empty() || self.is_empty() {
            return false;
        }
        if prefix.is_absolute_root() || self == prefix {
            return true;
        }
        match self.0.strip_prefix(prefix.as_str()) {
            Some(rest) => {
                !prefix.is_property_path() && (rest.starts_with('/') || rest.starts_with('.'))
            }
            None => false,
        }
    }

    /// Append a child prim name.
    pub fn append_child(&self, name: &str) -> StageResult<PrimPath> {
        if !self.is_absolute_root_or_prim_path() {
            return Err(StageError::validation(format!(
                "cannot append child to '{}'",
                self.0
            )));
        }
        if self.is_absolute_root() {
            Self::parse(&format!("/{name}"))
        } else {
            Self::parse(&format!("{}/{name}", self.0))
        }
    }

    /// Append a property name to a prim path.
    pub fn append_property(&self, name: &str) -> StageResult<PrimPath> {
        if self.is_empty() || self.is_absolute_root() || self.is_property_path() {
            return Err(StageError::validation(format!(
                "cannot append property to '{}'",
                self.0
            )));
        }
        Self::parse(&format!("{}.{name}", self.0))
    }

    /// Replace the `old` prefix of this path with `new`.
    ///
    /// Returns `None` when `old` is not a prefix of this path.
    pub fn replace_prefix(&self, old: &PrimPath, new: &PrimPath) -> Option<PrimPath> {
        if !self.has_prefix(old) {
            return None;
        }
        if self == old {
            return Some(new.clone());
        }
        let suffix = if old.is_absolute_root() {
            &self.0[1..]
        } else {
            &self.0[old.0.len()..]
        };
        let joined = if new.is_absolute_root() {
            format!("/{}", suffix.trim_start_matches('/'))
        } else if suffix.starts_with('.') || suffix.starts_with('/') {
            format!("{}{suffix}", new.0)
        } else {
            format!("{}/{suffix}", new.0)
        };
        Some(Self(joined))
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for PrimPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for PrimPath {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PrimPath {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        PrimPath::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Time at which attribute values are sampled.
///
/// `Default` addresses the non-animated value; numeric times address time samples.
#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize)]
pub enum TimeCode {
    /// The default (non time-sampled) value.
    #[default]
    Default,
    /// A numeric time code.
    At(f64),
}

impl TimeCode {
    /// Return `true` for [`TimeCode::Default`].
    pub fn is_default(self) -> bool {
        matches!(self, TimeCode::Default)
    }
}

impl PartialEq for TimeCode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimeCode {}

impl PartialOrd for TimeCode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeCode {
    // Default sorts before every numeric time.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TimeCode::Default, TimeCode::Default) => Ordering::Equal,
            (TimeCode::Default, TimeCode::At(_)) => Ordering::Less,
            (TimeCode::At(_), TimeCode::Default) => Ordering::Greater,
            (TimeCode::At(a), TimeCode::At(b)) => a.total_cmp(b),
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/core.rs"]
mod tests;

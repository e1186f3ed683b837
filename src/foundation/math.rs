use xxhash_rust::xxh3::Xxh3;

/// 3-component vector used for points, translations and extents.
pub type Vec3 = [f64; 3];

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
/// Axis-aligned 3D bounding box.
///
/// An empty box has `min > max` on every axis; union with an empty box is the identity.
pub struct Box3d {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl Default for Box3d {
    fn default() -> Self {
        Self::empty()
    }
}

impl Box3d {
    /// The empty box.
    pub fn empty() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }

    /// Build a box from its two corners.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Return `true` when the box contains no point.
    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| self.min[i] > self.max[i])
    }

    /// Smallest box containing every point in `points`.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vec3>) -> Self {
        points.into_iter().fold(Self::empty(), |b, p| b.include(*p))
    }

    /// Extend the box so it contains `p`.
    pub fn include(mut self, p: Vec3) -> Self {
        for (i, v) in p.iter().enumerate() {
            self.min[i] = self.min[i].min(*v);
            self.max[i] = self.max[i].max(*v);
        }
        self
    }

    /// Smallest box containing both boxes.
    pub fn union(&self, other: &Box3d) -> Box3d {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let mut out = *self;
        for i in 0..3 {
            out.min[i] = self.min[i].min(other.min[i]);
            out.max[i] = self.max[i].max(other.max[i]);
        }
        out
    }

    /// Box moved by `t`. Empty boxes stay empty.
    pub fn translated(&self, t: Vec3) -> Box3d {
        if self.is_empty() {
            return *self;
        }
        let mut out = *self;
        for i in 0..3 {
            out.min[i] += t[i];
            out.max[i] += t[i];
        }
        out
    }

    /// Return the box as the `[min, max]` pair authored in `extent` attributes.
    pub fn to_extent(&self) -> [Vec3; 2] {
        [self.min, self.max]
    }
}

const XXH3_SEED: u64 = 0x5f3c_9a12_d4e7_b801;

/// 128-bit content digest used for byte-identity comparisons of layer content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    /// High 64 bits.
    pub hi: u64,
    /// Low 64 bits.
    pub lo: u64,
}

/// Seeded xxh3 hasher with a small typed write API.
pub(crate) struct StableHasher {
    inner: Xxh3,
}

impl StableHasher {
    pub(crate) fn new() -> Self {
        Self {
            inner: Xxh3::with_seed(XXH3_SEED),
        }
    }

    pub(crate) fn write_bytes(&mut self, b: &[u8]) {
        self.inner.update(b);
    }

    pub(crate) fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub(crate) fn write_str(&mut self, s: &str) {
        self.write_u64(s.len() as u64);
        self.write_bytes(s.as_bytes());
    }

    pub(crate) fn finish(self) -> ContentDigest {
        let v = self.inner.digest128();
        ContentDigest {
            hi: (v >> 64) as u64,
            lo: v as u64,
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/math.rs"]
mod tests;

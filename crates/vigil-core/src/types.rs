use serde::{Deserialize, Serialize};

/// Fixed-length face descriptor vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute cosine similarity between two descriptors.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// A zero-norm operand yields 0.0 rather than NaN.
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// An enrolled identity loaded from the store: one entry of the gallery
/// the engine matches probe descriptors against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownIdentity {
    pub id: i64,
    pub name: String,
    pub descriptor: Descriptor,
}

/// Face region in pixel coordinates (top, right, bottom, left).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
    pub left: i64,
}

impl FaceRegion {
    pub fn width(&self) -> i64 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.bottom - self.top).max(0)
    }

    /// A region with zero pixel area. Degenerate regions embed to an
    /// all-zero descriptor instead of failing.
    pub fn is_degenerate(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Result of matching one detected face against the identity gallery.
///
/// `identity_id`/`identity_name` are `None` for unknown faces.
/// `distance` is `1 - similarity` of the best match (lower = better).
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub identity_id: Option<i64>,
    pub identity_name: Option<String>,
    pub region: FaceRegion,
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn unknown(region: FaceRegion) -> Self {
        Self {
            identity_id: None,
            identity_name: None,
            region,
            distance: None,
        }
    }
}

/// Liveness status of a camera source, as reported to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraStatus {
    Online,
    Offline,
    Disabled,
}

impl CameraStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStatus::Online => "online",
            CameraStatus::Offline => "offline",
            CameraStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(CameraStatus::Online),
            "offline" => Some(CameraStatus::Offline),
            "disabled" => Some(CameraStatus::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best candidate found by a gallery scan.
#[derive(Debug, Clone, Copy)]
pub struct GalleryHit {
    /// Index into the gallery slice.
    pub index: usize,
    /// Cosine similarity of the candidate [-1, 1].
    pub similarity: f32,
}

/// Strategy for scanning a probe descriptor against the identity gallery.
pub trait GalleryMatcher: Send + Sync {
    fn best_match(&self, probe: &Descriptor, gallery: &[KnownIdentity]) -> Option<GalleryHit>;
}

/// Cosine similarity matcher.
///
/// Gallery entries whose descriptor length differs from the probe are
/// skipped, not errors (mixed enrollment generations coexist in one
/// gallery). Ties resolve to the first-encountered maximum, so results
/// are deterministic as long as gallery insertion order is stable.
pub struct CosineMatcher;

impl GalleryMatcher for CosineMatcher {
    fn best_match(&self, probe: &Descriptor, gallery: &[KnownIdentity]) -> Option<GalleryHit> {
        let mut best: Option<GalleryHit> = None;

        for (i, identity) in gallery.iter().enumerate() {
            if identity.descriptor.len() != probe.len() {
                continue;
            }
            let sim = probe.similarity(&identity.descriptor);
            // Strict > keeps the first maximum on ties.
            if best.map_or(true, |b| sim > b.similarity) {
                best = Some(GalleryHit {
                    index: i,
                    similarity: sim,
                });
            }
        }

        best
    }
}

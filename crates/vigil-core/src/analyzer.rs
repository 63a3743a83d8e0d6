//! Detector/embedder capability seam.
//!
//! Face detection is pluggable: implement [`FaceDetector`] to provide a
//! custom backend (ONNX, cascade, external service) and compose it with
//! the standard patch embedder via [`PatchAnalyzer`].

use crate::frame::Frame;
use crate::types::{Descriptor, FaceRegion};
use image::imageops::{self, FilterType};
use image::GrayImage;

/// Side length of the normalized face patch; descriptors are
/// `PATCH_SIDE * PATCH_SIDE` floats.
pub const PATCH_SIDE: u32 = 112;

/// Pluggable face detection backend.
///
/// Detection failure is expressed as zero regions; errors never cross
/// this seam.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Vec<FaceRegion>;
}

/// Combined detection + descriptor extraction capability consumed by
/// the recognition engine.
pub trait FaceAnalyzer: Send + Sync {
    fn detect(&self, frame: &Frame) -> Vec<FaceRegion>;
    fn embed(&self, frame: &Frame, region: &FaceRegion) -> Descriptor;
}

/// Descriptor extraction by patch normalization: clamp-crop the region,
/// resize to `side`×`side`, scale to [0, 1] and L2-normalize.
///
/// A degenerate (zero-area) region yields a deterministic all-zero
/// descriptor; the matcher never sees an error from a malformed region.
pub struct PatchEmbedder {
    side: u32,
}

impl Default for PatchEmbedder {
    fn default() -> Self {
        Self { side: PATCH_SIDE }
    }
}

impl PatchEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn embed(&self, frame: &Frame, region: &FaceRegion) -> Descriptor {
        let dims = (self.side * self.side) as usize;

        let crop = match self.crop(frame, region) {
            Some(c) => c,
            None => return Descriptor::new(vec![0.0; dims]),
        };

        let resized = imageops::resize(&crop, self.side, self.side, FilterType::Triangle);

        let mut values: Vec<f32> = resized.into_raw().into_iter().map(|p| p as f32 / 255.0).collect();
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt() + 1e-9;
        for v in values.iter_mut() {
            *v /= norm;
        }

        Descriptor::new(values)
    }

    /// Clamp the region to frame bounds and copy it out. `None` when the
    /// clamped region has no pixels.
    fn crop(&self, frame: &Frame, region: &FaceRegion) -> Option<GrayImage> {
        if region.is_degenerate() || frame.width == 0 || frame.height == 0 {
            return None;
        }
        if frame.data.len() < (frame.width * frame.height) as usize {
            return None;
        }

        let x0 = region.left.clamp(0, frame.width as i64) as u32;
        let x1 = region.right.clamp(0, frame.width as i64) as u32;
        let y0 = region.top.clamp(0, frame.height as i64) as u32;
        let y1 = region.bottom.clamp(0, frame.height as i64) as u32;

        let w = x1.saturating_sub(x0);
        let h = y1.saturating_sub(y0);
        if w == 0 || h == 0 {
            return None;
        }

        let mut data = Vec::with_capacity((w * h) as usize);
        for y in y0..y1 {
            let row = (y * frame.width + x0) as usize;
            data.extend_from_slice(&frame.data[row..row + w as usize]);
        }

        GrayImage::from_raw(w, h, data)
    }
}

/// Degenerate detector proposing the full frame as a single candidate
/// region.
///
/// Suited to kiosk-style deployments where the camera frames one face
/// at a time, and to test harnesses. Multi-face scenes need a real
/// backend behind [`FaceDetector`].
pub struct FullFrameDetector;

impl FaceDetector for FullFrameDetector {
    fn detect(&self, frame: &Frame) -> Vec<FaceRegion> {
        if frame.width == 0 || frame.height == 0 {
            return Vec::new();
        }
        vec![FaceRegion {
            top: 0,
            right: frame.width as i64,
            bottom: frame.height as i64,
            left: 0,
        }]
    }
}

/// Pairs a pluggable detector with the standard patch embedder.
pub struct PatchAnalyzer<D> {
    detector: D,
    embedder: PatchEmbedder,
}

impl<D: FaceDetector> PatchAnalyzer<D> {
    pub fn new(detector: D) -> Self {
        Self {
            detector,
            embedder: PatchEmbedder::new(),
        }
    }
}

impl<D: FaceDetector> FaceAnalyzer for PatchAnalyzer<D> {
    fn detect(&self, frame: &Frame) -> Vec<FaceRegion> {
        self.detector.detect(frame)
    }

    fn embed(&self, frame: &Frame, region: &FaceRegion) -> Descriptor {
        self.embedder.embed(frame, region)
    }
}

//! Face matching and the recognition/attendance engine.
//!
//! Matches detected faces against a known-identity gallery and derives
//! presence state from the stream of identification events: check-in on
//! match, check-out on prolonged absence, unknown-snapshot logging on a
//! miss. Detection/embedding is a pluggable capability behind
//! [`FaceAnalyzer`]; persistence is a contract behind [`IdentityStore`].

pub mod analyzer;
pub mod engine;
pub mod frame;
pub mod store;
pub mod types;

pub use analyzer::{FaceAnalyzer, FaceDetector, FullFrameDetector, PatchAnalyzer, PatchEmbedder};
pub use engine::{EngineConfig, RecognitionEngine};
pub use frame::Frame;
pub use store::{IdentityStore, StoreError};
pub use types::{
    CameraStatus, CosineMatcher, Descriptor, FaceRegion, GalleryMatcher, KnownIdentity,
    MatchResult,
};

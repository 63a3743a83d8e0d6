//! Camera supervision.
//!
//! Keeps a dynamic set of heterogeneous, failure-prone video sources
//! alive indefinitely: one worker thread per source with reconnect and
//! backoff, supervised by a manager keyed on source id. Sources are
//! opened through the [`CaptureBackend`] seam; a V4L2 backend for local
//! devices ships here.

pub mod capture;
pub mod manager;
pub mod v4l2;
pub mod worker;

pub use capture::{CameraSpec, CaptureBackend, CaptureError, FrameStream, SourceKind};
pub use manager::CameraManager;
pub use v4l2::V4lBackend;
pub use worker::{CameraWorker, FrameCallback, WorkerConfig};

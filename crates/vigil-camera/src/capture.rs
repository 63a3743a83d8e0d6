//! Capture seam: how a camera source is described and opened.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vigil_core::Frame;

/// What a source's connection target means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Attached capture device; target is a device path or index.
    LocalDevice,
    /// Network stream; target is a stream URI.
    NetworkStream,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::LocalDevice => "local",
            SourceKind::NetworkStream => "network",
        }
    }

    /// Accepts canonical names plus the legacy `usb`/`rtsp`/`onvif`
    /// spellings found in older databases.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" | "usb" => Some(SourceKind::LocalDevice),
            "network" | "rtsp" | "onvif" => Some(SourceKind::NetworkStream),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one camera source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSpec {
    pub id: i64,
    pub name: String,
    pub kind: SourceKind,
    /// Device path/index for local devices, stream URI for network
    /// sources.
    pub target: String,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("open failed: {0}")]
    OpenFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("device busy")]
    Busy,
    #[error("source kind not supported by this backend: {0}")]
    Unsupported(SourceKind),
}

/// An open frame stream. Dropping the stream releases the capture
/// handle.
pub trait FrameStream: Send {
    fn read(&mut self) -> Result<Frame, CaptureError>;
}

/// Opens a readable frame stream for a source. Workers are otherwise
/// kind-agnostic; swapping backends swaps the transport.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, spec: &CameraSpec) -> Result<Box<dyn FrameStream>, CaptureError>;
}

//! V4L2 capture backend via the `v4l` crate.

use crate::capture::{CameraSpec, CaptureBackend, CaptureError, FrameStream, SourceKind};
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;
use vigil_core::Frame;

/// Negotiated pixel format for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel, native IR camera output).
    Grey,
}

/// Backend for locally attached V4L2 devices.
///
/// Network sources are rejected with [`CaptureError::Unsupported`];
/// stream transports plug in behind [`CaptureBackend`] separately.
pub struct V4lBackend {
    width: u32,
    height: u32,
}

impl Default for V4lBackend {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

impl V4lBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolution(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl CaptureBackend for V4lBackend {
    fn open(&self, spec: &CameraSpec) -> Result<Box<dyn FrameStream>, CaptureError> {
        match spec.kind {
            SourceKind::LocalDevice => {
                let path = resolve_device_path(&spec.target);
                let stream = V4lStream::open(&path, self.width, self.height)?;
                Ok(Box::new(stream))
            }
            SourceKind::NetworkStream => Err(CaptureError::Unsupported(spec.kind)),
        }
    }
}

/// Bare indices ("0") refer to /dev/videoN; anything else is taken as a
/// device path.
fn resolve_device_path(target: &str) -> String {
    match target.parse::<u32>() {
        Ok(index) => format!("/dev/video{index}"),
        Err(_) => target.to_string(),
    }
}

struct V4lStream {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl V4lStream {
    fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CaptureError> {
        if !Path::new(device_path).exists() {
            return Err(CaptureError::OpenFailed(format!(
                "device not found: {device_path}"
            )));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CaptureError::Busy
            } else {
                CaptureError::OpenFailed(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::OpenFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::OpenFailed(format!(
                "{device_path} does not support video capture"
            )));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CaptureError::OpenFailed(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CaptureError::OpenFailed(format!("set format: {e}")))?;

        let pixel_format = if negotiated.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if negotiated.fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(CaptureError::OpenFailed(format!(
                "unsupported pixel format {:?} (need YUYV or GREY)",
                negotiated.fourcc
            )));
        };

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?negotiated.fourcc,
            "opened local device"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    fn buf_to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CaptureError> {
        let pixels = (self.width * self.height) as usize;

        match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CaptureError::ReadFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Yuyv => yuyv_to_grayscale(buf, self.width, self.height),
        }
    }
}

impl FrameStream for V4lStream {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CaptureError::ReadFailed(format!("mmap stream: {e}")))?;

        let (buf, _meta) = stream
            .next()
            .map_err(|e| CaptureError::ReadFailed(format!("dequeue buffer: {e}")))?;

        let gray = self.buf_to_grayscale(buf)?;
        Ok(Frame::new(gray, self.width, self.height))
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; grayscale is
/// every even-indexed byte.
fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(CaptureError::ReadFailed(format!(
            "YUYV buffer too short: expected {expected}, got {}",
            yuyv.len()
        )));
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_too_short() {
        let yuyv = vec![100, 128];
        assert!(yuyv_to_grayscale(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_resolve_device_path() {
        assert_eq!(resolve_device_path("0"), "/dev/video0");
        assert_eq!(resolve_device_path("2"), "/dev/video2");
        assert_eq!(resolve_device_path("/dev/video5"), "/dev/video5");
    }

    #[test]
    fn test_network_kind_unsupported() {
        let spec = CameraSpec {
            id: 1,
            name: "door".into(),
            kind: SourceKind::NetworkStream,
            target: "rtsp://example/stream".into(),
        };
        assert!(matches!(
            V4lBackend::new().open(&spec),
            Err(CaptureError::Unsupported(_))
        ));
    }
}

//! Camera backend abstraction
//!
//! ## Responsibilities
//!
//! - One-shot PNG frame grabs from a platform capture device
//! - Default implementation shells out to ffmpeg (V4L2 input)
//! - stderr classification into "unavailable" vs "denied" failures

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

/// Parameters for a single frame grab
#[derive(Debug, Clone)]
pub struct FrameRequest {
    /// Platform device path (e.g. /dev/video0)
    pub device: String,
    /// Requested capture width (best effort)
    pub width: u32,
    /// Requested capture height (best effort)
    pub height: u32,
    /// Hard timeout for the grab in seconds
    pub timeout_secs: u64,
}

/// Capture device seam
///
/// Implementations read one still frame from the requested device and
/// return it PNG-encoded at the frame's native resolution.
#[async_trait]
pub trait CameraBackend: Send + Sync {
    /// Grab a single frame as PNG bytes
    ///
    /// # Errors
    ///
    /// Returns `Error::CameraUnavailable` when the platform has no usable
    /// capture device and `Error::PermissionDenied` when access to the
    /// device is declined or the device is held elsewhere.
    async fn grab_frame(&self, request: &FrameRequest) -> Result<Vec<u8>>;
}

/// ffmpeg-based V4L2 capture backend
pub struct FfmpegBackend;

impl FfmpegBackend {
    /// Create new backend
    pub fn new() -> Self {
        Self
    }

    /// Check if ffmpeg is available
    pub async fn check_ffmpeg() -> Result<String> {
        let output = Command::new("ffmpeg")
            .arg("-version")
            .output()
            .await
            .map_err(|e| Error::CameraUnavailable(format!("ffmpeg not found: {}", e)))?;

        if !output.status.success() {
            return Err(Error::CameraUnavailable(
                "ffmpeg version check failed".to_string(),
            ));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        // Extract first line (version info)
        let first_line = version.lines().next().unwrap_or("unknown");
        Ok(first_line.to_string())
    }

    /// Map ffmpeg stderr output to the capture error taxonomy
    fn classify_failure(stderr: &str) -> Error {
        let lowered = stderr.to_lowercase();

        if lowered.contains("permission denied")
            || lowered.contains("device or resource busy")
        {
            Error::PermissionDenied(format!("capture device rejected access: {}", stderr.trim()))
        } else {
            Error::CameraUnavailable(format!("capture failed: {}", stderr.trim()))
        }
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CameraBackend for FfmpegBackend {
    /// Grab one frame from a V4L2 device using ffmpeg
    ///
    /// Uses kill_on_drop(true) so a timeout drops (and SIGKILLs) the
    /// ffmpeg process instead of leaving it holding the device open.
    async fn grab_frame(&self, request: &FrameRequest) -> Result<Vec<u8>> {
        use std::process::Stdio;

        let video_size = format!("{}x{}", request.width, request.height);

        // -f v4l2: platform camera input
        // -video_size: ideal resolution hint (the driver may pick another)
        // -frames:v 1: capture only 1 frame
        // -f image2pipe -vcodec png: output as PNG to pipe
        let child = Command::new("ffmpeg")
            .args([
                "-f", "v4l2",
                "-video_size", &video_size,
                "-i", &request.device,
                "-frames:v", "1",
                "-f", "image2pipe",
                "-vcodec", "png",
                "-loglevel", "error",
                "-y",
                "-",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::CameraUnavailable(format!("ffmpeg spawn failed: {}", e)))?;

        let timeout_duration = Duration::from_secs(request.timeout_secs);

        match tokio::time::timeout(timeout_duration, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(Self::classify_failure(&stderr));
                }

                if output.stdout.is_empty() {
                    return Err(Error::CameraUnavailable(
                        "capture device returned no frame data".to_string(),
                    ));
                }

                Ok(output.stdout)
            }
            Ok(Err(e)) => Err(Error::CameraUnavailable(format!(
                "ffmpeg execution failed: {}",
                e
            ))),
            Err(_) => {
                // Timeout: the Child was dropped and kill_on_drop sent SIGKILL
                tracing::warn!(
                    timeout_sec = request.timeout_secs,
                    device = %request.device,
                    "ffmpeg timeout, process killed via kill_on_drop"
                );

                Err(Error::CameraUnavailable(format!(
                    "capture timeout ({}s) on {}",
                    request.timeout_secs, request.device
                )))
            }
        }
    }
}

/// Scripted backend for tests: serves a fixed frame and counts grabs
#[cfg(test)]
pub struct ScriptedBackend {
    frame: Vec<u8>,
    grabs: std::sync::atomic::AtomicUsize,
    fail_from: std::sync::atomic::AtomicUsize,
    last_device: std::sync::Mutex<Option<String>>,
}

#[cfg(test)]
impl ScriptedBackend {
    pub fn new(frame: Vec<u8>) -> Self {
        Self {
            frame,
            grabs: std::sync::atomic::AtomicUsize::new(0),
            fail_from: std::sync::atomic::AtomicUsize::new(usize::MAX),
            last_device: std::sync::Mutex::new(None),
        }
    }

    /// Grabs with index >= `n` (zero-based) fail with CameraUnavailable
    pub fn failing_from(frame: Vec<u8>, n: usize) -> Self {
        let backend = Self::new(frame);
        backend
            .fail_from
            .store(n, std::sync::atomic::Ordering::SeqCst);
        backend
    }

    pub fn grab_count(&self) -> usize {
        self.grabs.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn last_device(&self) -> Option<String> {
        self.last_device.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl CameraBackend for ScriptedBackend {
    async fn grab_frame(&self, request: &FrameRequest) -> Result<Vec<u8>> {
        let index = self.grabs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        *self.last_device.lock().unwrap() = Some(request.device.clone());

        if index >= self.fail_from.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::CameraUnavailable("scripted grab failure".to_string()));
        }

        Ok(self.frame.clone())
    }
}

/// Build a small RGB PNG for capture tests
#[cfg(test)]
pub fn encode_test_png(width: u32, height: u32, raw: Vec<u8>) -> Vec<u8> {
    use std::io::Cursor;

    let img = image::RgbImage::from_raw(width, height, raw).expect("raw buffer size");
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("png encode");
    out.into_inner()
}

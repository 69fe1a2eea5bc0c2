//! CaptureManager - Camera Device Lifecycle and Still Capture
//!
//! ## Responsibilities
//!
//! - Open/close/toggle of the capture device (exclusive, at most one open)
//! - One-shot still capture; the device is closed once a frame is taken
//! - Horizontal mirroring of front-camera frames
//! - File uploads decoded into the same CapturedImage representation
//! - Probe frame caching for display
//!
//! デバイスハンドルはDeviceGateのリース経由で保持し、capture/close/toggle/
//! リセットの全経路で解放される。

use crate::error::{Error, Result};
use image::GenericImageView;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

pub mod backend;
pub mod gate;

pub use backend::{CameraBackend, FfmpegBackend, FrameRequest};
pub use gate::{DeviceGate, DeviceLease};

/// Camera facing preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Front,
    Rear,
}

impl Facing {
    /// Convert to string for logging/serialization
    pub fn as_str(&self) -> &'static str {
        match self {
            Facing::Front => "front",
            Facing::Rear => "rear",
        }
    }

    /// The opposite facing
    pub fn toggled(&self) -> Facing {
        match self {
            Facing::Front => Facing::Rear,
            Facing::Rear => Facing::Front,
        }
    }
}

impl std::fmt::Display for Facing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an image entered the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Captured from the camera with the given facing
    Camera(Facing),
    /// Supplied as a file upload
    Upload,
}

impl ImageSource {
    /// Convert to string for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::Camera(_) => "camera",
            ImageSource::Upload => "upload",
        }
    }
}

/// Still image in the convergent representation both acquisition paths
/// produce: PNG bytes at native resolution, front frames already mirrored.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    /// PNG-encoded pixels
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub source: ImageSource,
}

impl CapturedImage {
    /// Build from a raw camera frame
    ///
    /// Front frames are mirrored horizontally so the stored image matches
    /// the mirror-preview the user saw; rear frames pass through untouched.
    pub fn from_camera_frame(png: Vec<u8>, facing: Facing) -> Result<Self> {
        let decoded = image::load_from_memory(&png)
            .map_err(|e| Error::InvalidImage(format!("camera frame decode failed: {}", e)))?;
        let (width, height) = decoded.dimensions();

        let png = match facing {
            Facing::Front => encode_png(&decoded.fliph())?,
            Facing::Rear => png,
        };

        Ok(Self {
            png,
            width,
            height,
            source: ImageSource::Camera(facing),
        })
    }

    /// Build from user-supplied file bytes (any format the decoder knows)
    pub fn from_upload_bytes(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| Error::InvalidImage(format!("uploaded image decode failed: {}", e)))?;
        let (width, height) = decoded.dimensions();
        let png = encode_png(&decoded)?;

        Ok(Self {
            png,
            width,
            height,
            source: ImageSource::Upload,
        })
    }
}

fn encode_png(img: &image::DynamicImage) -> Result<Vec<u8>> {
    use std::io::Cursor;

    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| Error::InvalidImage(format!("png encode failed: {}", e)))?;
    Ok(out.into_inner())
}

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Device path for the front camera
    pub front_device: String,
    /// Device path for the rear camera
    pub rear_device: String,
    /// Ideal capture width
    pub width: u32,
    /// Ideal capture height
    pub height: u32,
    /// Hard timeout per frame grab in seconds
    pub timeout_secs: u64,
    /// Directory for the cached probe frame
    pub frame_cache_dir: PathBuf,
}

impl CaptureSettings {
    /// Derive capture settings from the application config
    pub fn from_config(config: &crate::state::AppConfig) -> Self {
        Self {
            front_device: config.front_device.clone(),
            rear_device: config.rear_device.clone(),
            width: config.capture_width,
            height: config.capture_height,
            timeout_secs: config.capture_timeout_secs,
            frame_cache_dir: config.frame_cache_dir.clone(),
        }
    }
}

/// An open capture device: facing at open time plus the exclusive lease
struct OpenDevice {
    facing: Facing,
    _lease: DeviceLease,
}

/// CaptureManager instance
pub struct CaptureManager {
    backend: Arc<dyn CameraBackend>,
    gate: DeviceGate,
    settings: CaptureSettings,
    /// Facing preference for the next open
    facing: RwLock<Facing>,
    /// Currently open device, if any
    open_device: Mutex<Option<OpenDevice>>,
}

impl CaptureManager {
    /// Create new CaptureManager
    ///
    /// Creates the frame cache directory if it does not exist.
    pub async fn new(backend: Arc<dyn CameraBackend>, settings: CaptureSettings) -> Result<Self> {
        fs::create_dir_all(&settings.frame_cache_dir).await?;

        Ok(Self {
            backend,
            gate: DeviceGate::new(),
            settings,
            facing: RwLock::new(Facing::Front),
            open_device: Mutex::new(None),
        })
    }

    /// Open the capture device with the given facing
    ///
    /// Any previously open device is torn down first. On success a probe
    /// frame has been read (the stream is known to be readable) and cached,
    /// and the device stays open until capture/close/toggle.
    pub async fn open(&self, facing: Facing) -> Result<()> {
        let mut slot = self.open_device.lock().await;

        // 既にオープン済みなら先に必ずクローズ（デバイスロック滞留防止）
        if let Some(previous) = slot.take() {
            tracing::info!(facing = %previous.facing, "Force-closing previous capture device");
        }

        *self.facing.write().await = facing;

        let lease = self
            .gate
            .try_acquire()
            .ok_or_else(|| Error::Busy("camera device is held elsewhere".to_string()))?;

        let request = self.frame_request(facing);
        let probe = self.backend.grab_frame(&request).await?;
        self.save_probe_frame(&probe).await?;

        *slot = Some(OpenDevice {
            facing,
            _lease: lease,
        });

        tracing::info!(facing = %facing, device = %request.device, "Capture device opened");
        Ok(())
    }

    /// Capture a still image from the open device
    ///
    /// One-shot: the device is closed afterwards, on failure as well, so
    /// no stale handle survives any exit path.
    pub async fn capture(&self) -> Result<CapturedImage> {
        let mut slot = self.open_device.lock().await;

        let facing = match slot.as_ref() {
            Some(open) => open.facing,
            None => {
                return Err(Error::Internal(
                    "capture requested with no open device".to_string(),
                ))
            }
        };

        let request = self.frame_request(facing);
        let grabbed = self.backend.grab_frame(&request).await;

        // ワンショット撮影: 成否に関わらずここでクローズ
        slot.take();

        let frame = grabbed?;
        let image = CapturedImage::from_camera_frame(frame, facing)?;

        tracing::info!(
            facing = %facing,
            width = image.width,
            height = image.height,
            size = image.png.len(),
            "Still frame captured"
        );

        Ok(image)
    }

    /// Close the capture device; safe to call when nothing is open
    pub async fn close(&self) {
        let mut slot = self.open_device.lock().await;

        if slot.take().is_some() {
            tracing::info!("Capture device closed");
        } else {
            tracing::debug!("Close requested with no open device");
        }
    }

    /// Flip the facing preference
    ///
    /// Reopens the device with the new facing when one is open; otherwise
    /// only the preference for the next open changes.
    pub async fn toggle_facing(&self) -> Result<Facing> {
        let target = self.facing.read().await.toggled();

        let reopen = self.open_device.lock().await.is_some();
        if reopen {
            self.open(target).await?;
        } else {
            *self.facing.write().await = target;
        }

        tracing::info!(facing = %target, reopened = reopen, "Facing toggled");
        Ok(target)
    }

    /// Current facing preference
    pub async fn facing(&self) -> Facing {
        *self.facing.read().await
    }

    /// Whether a device is currently open
    pub async fn is_open(&self) -> bool {
        self.open_device.lock().await.is_some()
    }

    fn frame_request(&self, facing: Facing) -> FrameRequest {
        let device = match facing {
            Facing::Front => self.settings.front_device.clone(),
            Facing::Rear => self.settings.rear_device.clone(),
        };

        FrameRequest {
            device,
            width: self.settings.width,
            height: self.settings.height,
            timeout_secs: self.settings.timeout_secs,
        }
    }

    /// Write the probe frame to the cache directory (latest.png)
    async fn save_probe_frame(&self, data: &[u8]) -> Result<()> {
        let path = self.settings.frame_cache_dir.join("latest.png");
        fs::write(&path, data).await?;

        tracing::debug!(
            path = %path.display(),
            size = data.len(),
            "Saved probe frame"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::backend::{encode_test_png, ScriptedBackend};
    use super::*;

    /// Left pixel red, right pixel blue
    fn two_pixel_png() -> Vec<u8> {
        encode_test_png(2, 1, vec![255, 0, 0, 0, 0, 255])
    }

    async fn manager_with(backend: Arc<ScriptedBackend>) -> (CaptureManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = CaptureSettings {
            front_device: "/dev/video0".to_string(),
            rear_device: "/dev/video1".to_string(),
            width: 1280,
            height: 720,
            timeout_secs: 5,
            frame_cache_dir: dir.path().to_path_buf(),
        };
        let manager = CaptureManager::new(backend, settings).await.unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn test_open_then_capture_closes_device() {
        let backend = Arc::new(ScriptedBackend::new(two_pixel_png()));
        let (manager, _dir) = manager_with(backend.clone()).await;

        manager.open(Facing::Rear).await.unwrap();
        assert!(manager.is_open().await);

        let image = manager.capture().await.unwrap();
        assert!(!manager.is_open().await);
        assert_eq!(backend.grab_count(), 2); // probe + capture
        assert_eq!(image.width, 2);
        assert_eq!(image.height, 1);
        assert_eq!(image.source, ImageSource::Camera(Facing::Rear));
    }

    #[tokio::test]
    async fn test_front_frame_is_mirrored() {
        let image = CapturedImage::from_camera_frame(two_pixel_png(), Facing::Front).unwrap();
        let pixels = image::load_from_memory(&image.png).unwrap().to_rgb8();

        // Mirrored: blue moved to the left
        assert_eq!(*pixels.get_pixel(0, 0), image::Rgb([0u8, 0, 255]));
        assert_eq!(*pixels.get_pixel(1, 0), image::Rgb([255u8, 0, 0]));
    }

    #[tokio::test]
    async fn test_rear_frame_not_mirrored() {
        let image = CapturedImage::from_camera_frame(two_pixel_png(), Facing::Rear).unwrap();
        let pixels = image::load_from_memory(&image.png).unwrap().to_rgb8();

        assert_eq!(*pixels.get_pixel(0, 0), image::Rgb([255u8, 0, 0]));
        assert_eq!(*pixels.get_pixel(1, 0), image::Rgb([0u8, 0, 255]));
    }

    #[tokio::test]
    async fn test_open_twice_force_closes_previous() {
        let backend = Arc::new(ScriptedBackend::new(two_pixel_png()));
        let (manager, _dir) = manager_with(backend.clone()).await;

        manager.open(Facing::Front).await.unwrap();
        // Second open must not report the device as busy
        manager.open(Facing::Front).await.unwrap();

        assert!(manager.is_open().await);
        assert_eq!(backend.grab_count(), 2); // one probe per open
    }

    #[tokio::test]
    async fn test_toggle_reopens_with_new_device() {
        let backend = Arc::new(ScriptedBackend::new(two_pixel_png()));
        let (manager, _dir) = manager_with(backend.clone()).await;

        manager.open(Facing::Front).await.unwrap();
        assert_eq!(backend.last_device().as_deref(), Some("/dev/video0"));

        let facing = manager.toggle_facing().await.unwrap();
        assert_eq!(facing, Facing::Rear);
        assert!(manager.is_open().await);
        assert_eq!(backend.last_device().as_deref(), Some("/dev/video1"));

        // A capture succeeding proves the first lease was fully released
        let image = manager.capture().await.unwrap();
        assert_eq!(image.source, ImageSource::Camera(Facing::Rear));
        assert!(!manager.is_open().await);
    }

    #[tokio::test]
    async fn test_toggle_closed_updates_preference_only() {
        let backend = Arc::new(ScriptedBackend::new(two_pixel_png()));
        let (manager, _dir) = manager_with(backend.clone()).await;

        let facing = manager.toggle_facing().await.unwrap();
        assert_eq!(facing, Facing::Rear);
        assert_eq!(manager.facing().await, Facing::Rear);
        assert!(!manager.is_open().await);
        assert_eq!(backend.grab_count(), 0);
    }

    #[tokio::test]
    async fn test_capture_failure_closes_device() {
        // Probe succeeds, the capture grab fails
        let backend = Arc::new(ScriptedBackend::failing_from(two_pixel_png(), 1));
        let (manager, _dir) = manager_with(backend.clone()).await;

        manager.open(Facing::Front).await.unwrap();
        let err = manager.capture().await.unwrap_err();
        assert!(matches!(err, Error::CameraUnavailable(_)));
        assert!(!manager.is_open().await);

        // The lease must be free again: a failing re-open reports the
        // probe failure, not a busy device
        let err = manager.open(Facing::Front).await.unwrap_err();
        assert!(matches!(err, Error::CameraUnavailable(_)));
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let backend = Arc::new(ScriptedBackend::new(two_pixel_png()));
        let (manager, _dir) = manager_with(backend.clone()).await;

        manager.close().await;

        manager.open(Facing::Front).await.unwrap();
        manager.close().await;
        manager.close().await;
        assert!(!manager.is_open().await);
    }

    #[tokio::test]
    async fn test_probe_frame_cached_on_open() {
        let backend = Arc::new(ScriptedBackend::new(two_pixel_png()));
        let (manager, dir) = manager_with(backend.clone()).await;

        manager.open(Facing::Front).await.unwrap();

        let cached = std::fs::read(dir.path().join("latest.png")).unwrap();
        assert_eq!(cached, two_pixel_png());
    }

    #[tokio::test]
    async fn test_upload_rejects_undecodable_bytes() {
        let err = CapturedImage::from_upload_bytes(b"not an image").unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[tokio::test]
    async fn test_upload_converges_to_png_representation() {
        let image = CapturedImage::from_upload_bytes(&two_pixel_png()).unwrap();
        assert_eq!(image.width, 2);
        assert_eq!(image.height, 1);
        assert_eq!(image.source, ImageSource::Upload);

        // Payload is decodable PNG regardless of the upload format
        assert!(image::load_from_memory(&image.png).is_ok());
    }
}

//! Session State Machine
//!
//! ## Responsibilities
//!
//! - Drive the three-step flow: AwaitingInput (acquire an image) ->
//!   Previewing (confirm the still) -> Reporting (show the result)
//! - Converge camera captures and file uploads on one image representation
//! - Keep the error surface on the session (last_error is orthogonal to
//!   the phase); analysis failures keep the image so the user can retry
//!   without re-acquiring
//! - Discard analysis results that land after a reset (generation guard)
//! - Best-effort history append; persistence failures never block a report

use crate::analysis::AnalysisClient;
use crate::capture::{CaptureManager, CapturedImage, Facing};
use crate::error::{Error, Result};
use crate::history::{HistoryRecord, HistoryStore, SnapshotStream};
use crate::identity::IdentityBootstrap;
use crate::models::Report;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Acquiring an image: nothing held yet, the camera may be live
    AwaitingInput,
    /// A still image is held, waiting for the user to submit it
    Previewing,
    /// A report is on display
    Reporting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::AwaitingInput => "awaiting_input",
            Phase::Previewing => "previewing",
            Phase::Reporting => "reporting",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of the session for rendering
#[derive(Debug, Clone)]
pub struct SessionView {
    pub phase: Phase,
    pub facing: Facing,
    pub camera_open: bool,
    pub analyzing: bool,
    pub has_image: bool,
    pub result: Option<Report>,
    pub last_error: Option<String>,
}

struct SessionInner {
    phase: Phase,
    image: Option<CapturedImage>,
    captured_at: Option<DateTime<Utc>>,
    result: Option<Report>,
    last_error: Option<String>,
    analyzing: bool,
    /// Bumped on every reset and new acquisition; analysis results from
    /// older generations are discarded when they land
    generation: u64,
}

impl Default for SessionInner {
    fn default() -> Self {
        Self {
            phase: Phase::AwaitingInput,
            image: None,
            captured_at: None,
            result: None,
            last_error: None,
            analyzing: false,
            generation: 0,
        }
    }
}

/// SessionEngine instance
pub struct SessionEngine {
    capture: Arc<CaptureManager>,
    analysis: Arc<AnalysisClient>,
    history: Arc<dyn HistoryStore>,
    identity: Arc<IdentityBootstrap>,
    inner: Mutex<SessionInner>,
}

impl SessionEngine {
    /// Create new SessionEngine
    pub fn new(
        capture: Arc<CaptureManager>,
        analysis: Arc<AnalysisClient>,
        history: Arc<dyn HistoryStore>,
        identity: Arc<IdentityBootstrap>,
    ) -> Self {
        Self {
            capture,
            analysis,
            history,
            identity,
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// Open the camera with the current facing preference
    pub async fn start_camera(&self) -> Result<()> {
        let facing = self.capture.facing().await;
        self.open_camera(facing).await
    }

    /// Open the camera for a new acquisition. Starting over discards any
    /// previously held image or report. On failure the error is recorded
    /// and calling again retries from scratch.
    pub async fn open_camera(&self, facing: Facing) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.analyzing {
                return Err(Error::Busy("analysis in progress".to_string()));
            }
        }

        match self.capture.open(facing).await {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                inner.generation = inner.generation.wrapping_add(1);
                inner.phase = Phase::AwaitingInput;
                inner.image = None;
                inner.captured_at = None;
                inner.result = None;
                inner.last_error = None;
                tracing::info!(facing = %facing, "Camera opened for a new acquisition");
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Take a still from the open camera and enter Previewing. The device
    /// is closed by the capture, on failure as well.
    pub async fn capture_still(&self) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.analyzing {
                return Err(Error::Busy("analysis in progress".to_string()));
            }
        }

        match self.capture.capture().await {
            Ok(image) => {
                let mut inner = self.inner.lock().await;
                inner.generation = inner.generation.wrapping_add(1);
                inner.image = Some(image);
                inner.captured_at = Some(Utc::now());
                inner.phase = Phase::Previewing;
                inner.result = None;
                inner.last_error = None;
                tracing::info!("Still captured, session previewing");
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Decode a user-supplied image file and enter Previewing. Uploads
    /// take the same path as camera stills from here on.
    pub async fn supply_upload(&self, bytes: &[u8]) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.analyzing {
                return Err(Error::Busy("analysis in progress".to_string()));
            }
        }

        // ファイル入力時はカメラを使わない
        self.capture.close().await;

        match CapturedImage::from_upload_bytes(bytes) {
            Ok(image) => {
                let mut inner = self.inner.lock().await;
                inner.generation = inner.generation.wrapping_add(1);
                inner.image = Some(image);
                inner.captured_at = Some(Utc::now());
                inner.phase = Phase::Previewing;
                inner.result = None;
                inner.last_error = None;
                tracing::info!("Upload decoded, session previewing");
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Submit the held image for analysis. Success moves to Reporting and
    /// persists a history record; failure stays in Previewing with the
    /// image intact so analyze() can simply be called again.
    pub async fn analyze(&self) -> Result<Report> {
        let (generation, png, captured_at) = {
            let mut inner = self.inner.lock().await;

            if inner.analyzing {
                return Err(Error::Busy("analysis already in progress".to_string()));
            }
            if inner.phase != Phase::Previewing {
                return Err(Error::Internal(format!(
                    "analyze requires a previewed image, session is {}",
                    inner.phase
                )));
            }
            let Some(image) = inner.image.as_ref() else {
                return Err(Error::Internal("no image to analyze".to_string()));
            };

            let png = image.png.clone();
            let captured_at = inner.captured_at.unwrap_or_else(Utc::now);
            inner.analyzing = true;
            inner.last_error = None;
            (inner.generation, png, captured_at)
        };

        let result = self.analysis.analyze(&png).await;

        let mut inner = self.inner.lock().await;

        if inner.generation != generation {
            // セッションは既にリセット済み。結果は破棄する
            tracing::info!("Discarding analysis outcome from a superseded session");
            return Err(Error::Superseded(
                "session was reset while the analysis ran".to_string(),
            ));
        }
        inner.analyzing = false;

        match result {
            Ok(report) => {
                inner.phase = Phase::Reporting;
                inner.result = Some(report.clone());
                inner.last_error = None;
                drop(inner);

                self.append_history(&png, captured_at, &report).await;
                Ok(report)
            }
            Err(e) => {
                // 画像は保持。再取得なしで再解析できる
                inner.result = None;
                inner.last_error = Some(e.to_string());
                tracing::warn!(error = %e, "Analysis failed");
                Err(e)
            }
        }
    }

    /// Flip the camera facing. While the camera is open the device is
    /// reopened with the new facing; otherwise only the preference for
    /// the next open changes.
    pub async fn toggle_facing(&self) -> Result<Facing> {
        {
            let inner = self.inner.lock().await;
            if inner.analyzing {
                return Err(Error::Busy("analysis in progress".to_string()));
            }
        }

        match self.capture.toggle_facing().await {
            Ok(facing) => Ok(facing),
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Abandon the current flow and return to the initial screen. Covers
    /// both retake/discard and closing a report. An in-flight analysis
    /// keeps running but its result is discarded when it lands.
    pub async fn reset(&self) {
        self.capture.close().await;

        let mut inner = self.inner.lock().await;
        inner.generation = inner.generation.wrapping_add(1);
        inner.phase = Phase::AwaitingInput;
        inner.image = None;
        inner.captured_at = None;
        inner.result = None;
        inner.last_error = None;
        inner.analyzing = false;

        tracing::info!(generation = inner.generation, "Session reset");
    }

    /// Current session view for rendering
    pub async fn view(&self) -> SessionView {
        let facing = self.capture.facing().await;
        let camera_open = self.capture.is_open().await;
        let inner = self.inner.lock().await;

        SessionView {
            phase: inner.phase,
            facing,
            camera_open,
            analyzing: inner.analyzing,
            has_image: inner.image.is_some(),
            result: inner.result.clone(),
            last_error: inner.last_error.clone(),
        }
    }

    /// The still image currently held for preview, if any
    pub async fn captured_image(&self) -> Option<CapturedImage> {
        self.inner.lock().await.image.clone()
    }

    /// Subscribe to the identity's history snapshots. None when no
    /// identity is available (history disabled).
    pub async fn subscribe_history(&self) -> Option<SnapshotStream> {
        let identity = self.identity.identity().await?;
        Some(self.history.subscribe(&identity.uid).await)
    }

    /// Remove a history record for the current identity
    pub async fn remove_record(&self, record_id: &str) -> Result<()> {
        let Some(identity) = self.identity.identity().await else {
            return Err(Error::IdentityUnavailable(
                "no identity, history is disabled".to_string(),
            ));
        };

        self.history.remove(&identity.uid, record_id).await
    }

    /// Best-effort persistence of a finished report. Failure is logged
    /// and swallowed.
    async fn append_history(&self, png: &[u8], captured_at: DateTime<Utc>, report: &Report) {
        let Some(identity) = self.identity.identity().await else {
            tracing::debug!("No identity, skipping history append");
            return;
        };

        let thumbnail = base64::engine::general_purpose::STANDARD.encode(png);
        let record = HistoryRecord::new(captured_at, thumbnail, report.clone());
        let record_id = record.id.clone();

        match self.history.append(&identity.uid, record).await {
            Ok(()) => {
                tracing::debug!(record_id = %record_id, uid = %identity.uid, "Analysis record persisted");
            }
            Err(e) => {
                tracing::warn!(error = %e, record_id = %record_id, "Failed to persist analysis record");
            }
        }
    }
}

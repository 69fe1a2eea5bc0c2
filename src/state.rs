//! Application state
//!
//! Holds all shared components and state

use crate::analysis::AnalysisClient;
use crate::capture::CaptureManager;
use crate::history::HistoryStore;
use crate::identity::IdentityBootstrap;
use crate::session::SessionEngine;
use std::path::PathBuf;
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Front camera device path
    pub front_device: String,
    /// Rear camera device path
    pub rear_device: String,
    /// Ideal capture width
    pub capture_width: u32,
    /// Ideal capture height
    pub capture_height: u32,
    /// Per-frame capture timeout
    pub capture_timeout_secs: u64,
    /// Probe frame cache directory (for preview display)
    pub frame_cache_dir: PathBuf,
    /// Base URL of the generative analysis endpoint
    pub analysis_url: String,
    /// Model used for lip analysis
    pub analysis_model: String,
    /// Analysis request timeout
    pub analysis_timeout_secs: u64,
    /// API key for the analysis and identity endpoints
    pub api_key: String,
    /// History service URL (history falls back to in-memory when unset)
    pub history_url: Option<String>,
    /// History snapshot poll interval
    pub history_poll_secs: u64,
    /// Identity endpoint URL (history is disabled when unset)
    pub identity_url: Option<String>,
    /// Custom sign-in token (anonymous sign-up when unset)
    pub identity_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            front_device: std::env::var("LIPSCAN_FRONT_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            rear_device: std::env::var("LIPSCAN_REAR_DEVICE")
                .unwrap_or_else(|_| "/dev/video1".to_string()),
            capture_width: std::env::var("LIPSCAN_CAPTURE_WIDTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1280),
            capture_height: std::env::var("LIPSCAN_CAPTURE_HEIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(720),
            capture_timeout_secs: std::env::var("LIPSCAN_CAPTURE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            frame_cache_dir: std::env::var("LIPSCAN_FRAME_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/lipscan/frames")),
            analysis_url: std::env::var("LIPSCAN_ANALYSIS_URL").unwrap_or_else(|_| {
                "https://generativelanguage.googleapis.com/v1beta/models".to_string()
            }),
            analysis_model: std::env::var("LIPSCAN_ANALYSIS_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
            analysis_timeout_secs: std::env::var("LIPSCAN_ANALYSIS_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            api_key: std::env::var("LIPSCAN_API_KEY").unwrap_or_default(),
            history_url: std::env::var("LIPSCAN_HISTORY_URL").ok(),
            history_poll_secs: std::env::var("LIPSCAN_HISTORY_POLL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            identity_url: std::env::var("LIPSCAN_IDENTITY_URL").ok(),
            identity_token: std::env::var("LIPSCAN_IDENTITY_TOKEN").ok(),
        }
    }
}

/// Application state holding the wired components
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// CaptureManager (device lifecycle and still capture)
    pub capture: Arc<CaptureManager>,
    /// AnalysisClient (generateContent adapter)
    pub analysis: Arc<AnalysisClient>,
    /// HistoryStore (REST service or in-memory)
    pub history: Arc<dyn HistoryStore>,
    /// IdentityBootstrap (anonymous or token sign-in, once per process)
    pub identity: Arc<IdentityBootstrap>,
    /// SessionEngine (screen flow)
    pub session: Arc<SessionEngine>,
}

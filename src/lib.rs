//! Lipscan Library
//!
//! Lip hydration capture-and-analysis session core
//!
//! ## Architecture (5 Components)
//!
//! 1. CaptureManager - Camera device lifecycle and still capture
//! 2. SessionEngine - Screen flow state machine
//! 3. AnalysisClient - Generative lip analysis adapter
//! 4. HistoryStore - Persisted analysis records (REST or in-memory)
//! 5. IdentityBootstrap - Once-per-process identity resolution
//!
//! ## Design Principles
//!
//! - The session engine owns all state transitions; callers only render views
//! - Every acquisition path converges on one still-image representation
//! - History is best-effort: persistence failures never block a report

pub mod analysis;
pub mod capture;
pub mod history;
pub mod identity;
pub mod session;
pub mod models;
pub mod error;
pub mod state;

pub use error::{Error, Result};
pub use state::AppState;

//! Lipscan - Lip Hydration Analysis Client
//!
//! Main entry point for the lipscan CLI.

use lipscan::analysis::AnalysisClient;
use lipscan::capture::{CaptureManager, CaptureSettings, FfmpegBackend};
use lipscan::history::{HistoryStore, MemoryHistoryStore, RestHistoryStore};
use lipscan::identity::IdentityBootstrap;
use lipscan::models::Report;
use lipscan::session::SessionEngine;
use lipscan::state::{AppConfig, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lipscan=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Lipscan v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        front_device = %config.front_device,
        rear_device = %config.rear_device,
        analysis_url = %config.analysis_url,
        analysis_model = %config.analysis_model,
        frame_cache_dir = %config.frame_cache_dir.display(),
        "Configuration loaded"
    );

    // ffmpegはカメラ経路のみで必要。ファイル入力は無くても動く
    match FfmpegBackend::check_ffmpeg().await {
        Ok(version) => tracing::info!(version = %version, "ffmpeg available"),
        Err(e) => tracing::warn!(error = %e, "ffmpeg not available, camera capture will fail"),
    }

    // Initialize components
    let backend = Arc::new(FfmpegBackend::new());
    let capture =
        Arc::new(CaptureManager::new(backend, CaptureSettings::from_config(&config)).await?);
    tracing::info!("CaptureManager initialized");

    let analysis = Arc::new(AnalysisClient::with_timeout(
        &config.analysis_url,
        &config.analysis_model,
        &config.api_key,
        config.analysis_timeout_secs,
    ));
    tracing::info!(model = %config.analysis_model, "AnalysisClient initialized");

    let history: Arc<dyn HistoryStore> = if let Some(ref url) = config.history_url {
        tracing::info!(history_url = %url, "Using REST history store");
        Arc::new(RestHistoryStore::with_poll_interval(
            url,
            config.history_poll_secs,
        ))
    } else {
        tracing::info!("LIPSCAN_HISTORY_URL not set, using in-memory history store");
        Arc::new(MemoryHistoryStore::new())
    };

    let identity = Arc::new(IdentityBootstrap::new(
        config.identity_url.as_deref().unwrap_or(""),
        &config.api_key,
        config.identity_token.clone(),
    ));
    if config.identity_url.is_none() {
        tracing::info!("LIPSCAN_IDENTITY_URL not set, history is disabled");
    }

    // Identityは起動時に一度だけ確立する。失敗時は履歴なしで続行
    let history_enabled = identity.identity().await.is_some();
    tracing::info!(history_enabled, "IdentityBootstrap initialized");

    let session = Arc::new(SessionEngine::new(
        capture.clone(),
        analysis.clone(),
        history.clone(),
        identity.clone(),
    ));
    tracing::info!("SessionEngine initialized");

    // Create application state
    let state = AppState {
        config,
        capture,
        analysis,
        history,
        identity,
        session,
    };

    match std::env::args().nth(1).as_deref() {
        Some("history") => show_history(&state).await,
        Some(path) => analyze_file(&state, path).await,
        None => capture_once(&state).await,
    }
}

/// Capture one frame from the camera and print the analysis
async fn capture_once(state: &AppState) -> anyhow::Result<()> {
    state.session.start_camera().await?;
    state.session.capture_still().await?;
    let report = state.session.analyze().await?;
    print_report(&report);
    print_history_summary(state).await;
    state.session.reset().await;
    Ok(())
}

/// Analyze an image file and print the report
async fn analyze_file(state: &AppState, path: &str) -> anyhow::Result<()> {
    tracing::info!(path = %path, "Analyzing image file");
    let bytes = tokio::fs::read(path).await?;
    state.session.supply_upload(&bytes).await?;
    let report = state.session.analyze().await?;
    print_report(&report);
    print_history_summary(state).await;
    state.session.reset().await;
    Ok(())
}

/// Post-flow history echo. Quiet when history is disabled.
async fn print_history_summary(state: &AppState) {
    let Some(mut stream) = state.session.subscribe_history().await else {
        return;
    };

    if let Some(Ok(records)) = stream.next().await {
        println!("History now holds {} record(s):", records.len());
        for record in records.iter().take(3) {
            println!(
                "  {}  {}",
                record.captured_at.format("%Y-%m-%d %H:%M:%S"),
                record.report.dehydration_status
            );
        }
    }
}

/// Print the current history snapshot
async fn show_history(state: &AppState) -> anyhow::Result<()> {
    let Some(mut stream) = state.session.subscribe_history().await else {
        println!("History is unavailable (no identity).");
        return Ok(());
    };

    match stream.next().await {
        Some(Ok(records)) if records.is_empty() => println!("No analysis records yet."),
        Some(Ok(records)) => {
            for record in records {
                println!(
                    "{}  {}  {}",
                    record.captured_at.format("%Y-%m-%d %H:%M:%S"),
                    record.id,
                    record.report.dehydration_status
                );
            }
        }
        Some(Err(e)) => println!("History unavailable: {}", e),
        None => println!("History stream ended."),
    }

    Ok(())
}

fn print_report(report: &Report) {
    println!();
    println!("Status: {}", report.dehydration_status);
    println!(
        "Moisture {:>3}  Dryness {:>3}  Cracks {:>3}",
        report.metrics.moisture_score, report.metrics.dryness_level, report.metrics.crack_intensity
    );
    if let Some(ref color) = report.metrics.color_description {
        println!("Color: {}", color);
    }
    for observation in &report.visual_observations {
        println!("  - {}", observation);
    }
    if !report.recommendations.is_empty() {
        println!("Recommended:");
        for recommendation in &report.recommendations {
            println!("  * {}", recommendation);
        }
    }
    println!("{}", report.summary);
    println!();
}

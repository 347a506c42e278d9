mod db;
mod engine;
mod errors;
mod lifecycle;
mod models;
mod presets;
mod scheduler;
mod sensitivity;
mod settings;

pub use crate::db::{AdjustmentFilter, Database, SortKey, StoreTx, TransactionOutcome};
pub use crate::engine::AdjustmentEngine;
pub use crate::errors::{AppError, AppResult};
pub use crate::lifecycle::{LifecycleController, Transition};
pub use crate::models::{
    ActiveAdjustment, AdjustmentDraft, AdjustmentKind, AdjustmentRecord, AdjustmentSettings, EffectiveAdjustments,
    GlucoseUnits, OverrideParams, RunRecord, SaveAdjustmentPayload, SliderBoundsConfig, SmbSchedule, MGDL_PER_MMOLL,
};
pub use crate::presets::PresetManager;
pub use crate::scheduler::{CancellationToken, Executor, ExecutorFuture, ScheduledActivation, Scheduler, MAX_TICK};
pub use crate::sensitivity::{
    compute_adjusted_percentage, compute_half_basal_target, compute_slider_bounds, is_adjustment_eligible,
    round_percentage_to_step, round_target_to_step, SliderBounds, MAX_PERCENTAGE, MIN_PERCENTAGE,
};
pub use crate::settings::SettingsHub;

use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Prepares the data directory, installs logging and opens the engine with
/// its pending schedules re-armed. Must run inside a Tokio runtime.
pub async fn open(app_data_dir: PathBuf) -> AppResult<Arc<AdjustmentEngine>> {
    std::fs::create_dir_all(&app_data_dir)?;
    if let Err(error) = init_tracing(&app_data_dir) {
        eprintln!("adjustment engine logging disabled: {error}");
    }

    let engine = AdjustmentEngine::new(app_data_dir)?;
    match engine.start().await {
        Ok(restored) => tracing::info!(restored, "adjustment engine started"),
        Err(error) => tracing::warn!(error = %error, "failed to restore scheduled adjustments"),
    }
    Ok(engine)
}

pub fn init_tracing(app_data_dir: &std::path::Path) -> Result<(), String> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "adjustments.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

use crate::db::Database;
use crate::errors::AppResult;
use crate::lifecycle::{build_record, LifecycleController, Transition};
use crate::models::{
    ActiveAdjustment, AdjustmentDraft, AdjustmentKind, AdjustmentRecord, AdjustmentSettings, EffectiveAdjustments,
    RunRecord, SaveAdjustmentPayload,
};
use crate::presets::PresetManager;
use crate::scheduler::{ExecutorFuture, ScheduledActivation, Scheduler};
use crate::sensitivity::{compute_slider_bounds, is_adjustment_eligible, SliderBounds};
use crate::settings::SettingsHub;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

/// Composition root handed to UI and dosing collaborators.
#[derive(Clone)]
pub struct AdjustmentEngine {
    db: Arc<Database>,
    settings: SettingsHub,
    lifecycle: Arc<LifecycleController>,
    presets: PresetManager,
    scheduler: Scheduler,
    app_data_dir: PathBuf,
}

impl AdjustmentEngine {
    pub fn new(app_data_dir: PathBuf) -> AppResult<Arc<Self>> {
        let db_path = app_data_dir.join("adjustments.sqlite");
        let db = Arc::new(Database::new(&db_path)?);
        let settings = SettingsHub::load(db.clone())?;
        let tick = Duration::from_secs(settings.current().scheduler_tick_seconds);
        let lifecycle = Arc::new(LifecycleController::new(db.clone(), settings.clone()));
        let scheduler = Scheduler::new(db.clone(), tick);

        let weak = Arc::downgrade(&lifecycle);
        scheduler.set_executor(Arc::new(move |adjustment_id: String| -> ExecutorFuture {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(lifecycle) => lifecycle.enact_scheduled(&adjustment_id),
                    None => Transition::Aborted,
                }
            })
        }));

        Ok(Arc::new(Self {
            db,
            settings,
            presets: PresetManager::new(lifecycle.clone()),
            lifecycle,
            scheduler,
            app_data_dir,
        }))
    }

    /// Sweeps adjustments that ran out while the process was down and re-arms
    /// pending schedules. Must run inside a Tokio runtime.
    pub async fn start(&self) -> AppResult<usize> {
        let expired = self.lifecycle.expire_elapsed(Utc::now());
        if expired > 0 {
            tracing::warn!(count = expired, "expired adjustments that ended while stopped");
        }
        self.scheduler.restore_pending().await
    }

    pub fn app_data_dir(&self) -> &Path {
        &self.app_data_dir
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn enact(&self, id: &str) -> Transition {
        self.lifecycle.enact(id, false)
    }

    pub fn cancel_all(&self, kind: AdjustmentKind, except_id: Option<&str>, create_audit_entry: bool) -> Transition {
        self.lifecycle.cancel_all(kind, except_id, create_audit_entry)
    }

    pub fn stop(&self, kind: AdjustmentKind) -> Transition {
        self.lifecycle.stop(kind)
    }

    /// Starts a custom adjustment now, or schedules it when its start lies ahead.
    pub async fn save_custom(&self, payload: SaveAdjustmentPayload) -> AppResult<AdjustmentRecord> {
        let now = Utc::now();
        match payload.start_at.filter(|start| *start > now) {
            Some(start_at) => {
                let record = build_record(&payload, false, &self.settings.current(), now)?;
                let activation = self.scheduler.schedule(record, start_at).await?;
                self.db.resolve(&activation.adjustment_id)
            }
            None => self.lifecycle.save_custom(&payload),
        }
    }

    pub async fn schedule(&self, payload: SaveAdjustmentPayload) -> AppResult<ScheduledActivation> {
        let now = Utc::now();
        let start_at = payload.start_at.unwrap_or(now);
        let record = build_record(&payload, false, &self.settings.current(), now)?;
        self.scheduler.schedule(record, start_at).await
    }

    pub async fn pending_schedules(&self) -> Vec<ScheduledActivation> {
        self.scheduler.pending().await
    }

    /// Deletes any adjustment, canceling its timer if it was still scheduled.
    pub async fn delete(&self, id: &str) -> Transition {
        self.scheduler.cancel(id).await;
        match self.db.try_resolve(id) {
            Ok(Some(record)) if record.is_preset => self.presets.delete_preset(id),
            _ => self.lifecycle.delete(id),
        }
    }

    pub fn save_preset(&self, payload: &SaveAdjustmentPayload) -> AppResult<AdjustmentRecord> {
        self.presets.save_preset(payload)
    }

    pub fn list_presets(&self, kind: AdjustmentKind) -> AppResult<Vec<AdjustmentRecord>> {
        self.presets.list(kind)
    }

    pub fn reorder(&self, kind: AdjustmentKind, order: &[String]) -> AppResult<bool> {
        self.presets.reorder(kind, order)
    }

    pub fn enact_preset(&self, preset_id: &str) -> Transition {
        self.presets.enact_preset(preset_id)
    }

    pub fn update_preset(&self, preset_id: &str, payload: &SaveAdjustmentPayload) -> AppResult<AdjustmentRecord> {
        self.presets.update_preset(preset_id, payload)
    }

    /// Duplicates the running preset of `kind` for editing. `Ok(None)` when no
    /// preset is running.
    pub fn duplicate_active_and_edit(&self, kind: AdjustmentKind) -> AppResult<Option<String>> {
        let Some(active) = self.lifecycle.active(kind) else {
            return Ok(None);
        };
        let record = self.db.resolve(&active.id)?;
        if !record.is_preset {
            return Ok(None);
        }
        self.presets.duplicate_active_and_edit(&record.id).map(Some)
    }

    pub fn commit_edit(&self, id: &str, payload: &SaveAdjustmentPayload) -> AppResult<AdjustmentRecord> {
        self.presets.commit_edit(id, payload)
    }

    pub fn active(&self, kind: AdjustmentKind) -> Option<ActiveAdjustment> {
        self.lifecycle.active(kind)
    }

    pub fn draft(&self, kind: AdjustmentKind) -> AdjustmentDraft {
        self.lifecycle.draft(kind)
    }

    pub fn set_draft(&self, kind: AdjustmentKind, draft: AdjustmentDraft) {
        self.lifecycle.set_draft(kind, draft);
    }

    /// Polled once per dosing cycle.
    pub fn effective_state(&self) -> AppResult<EffectiveAdjustments> {
        self.lifecycle.effective_state(Utc::now())
    }

    pub fn expire_elapsed(&self) -> usize {
        self.lifecycle.expire_elapsed(Utc::now())
    }

    pub fn list_runs(&self, kind: AdjustmentKind, limit: u32) -> AppResult<Vec<RunRecord>> {
        self.db.list_runs(kind, limit)
    }

    pub fn pending_uploads(&self, kind: AdjustmentKind) -> AppResult<Vec<AdjustmentRecord>> {
        self.db.pending_uploads(kind)
    }

    pub fn mark_uploaded(&self, ids: &[String]) -> AppResult<usize> {
        self.db.mark_uploaded(ids)
    }

    pub fn settings(&self) -> AdjustmentSettings {
        self.settings.current()
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AdjustmentSettings> {
        let settings = self.settings.update(update)?;
        for kind in AdjustmentKind::ALL {
            self.lifecycle.refresh_active(kind);
        }
        Ok(settings)
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<AdjustmentSettings> {
        self.settings.subscribe()
    }

    /// Percentage slider range for a temporary target given in display units.
    /// Collapses to 100 % when the policy flags leave the target without effect.
    pub fn slider_bounds(&self, target: f64) -> SliderBounds {
        let settings = self.settings.current();
        let target = settings.units.to_mgdl(target);
        let eligible = is_adjustment_eligible(
            target,
            settings.normal_target,
            settings.low_target_lowers_sensitivity,
            settings.high_target_raises_sensitivity,
            settings.exercise_mode,
        );
        if !eligible {
            return SliderBounds::neutral();
        }
        compute_slider_bounds(
            target,
            settings.normal_target,
            settings.max_sensitivity_ratio,
            &settings.slider_bounds,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::AdjustmentEngine;
    use crate::models::{AdjustmentKind, SaveAdjustmentPayload};
    use crate::sensitivity::SliderBounds;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn future_start_is_scheduled_disabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = AdjustmentEngine::new(dir.path().to_path_buf()).expect("engine");
        let record = engine
            .save_custom(
                SaveAdjustmentPayload::temp_target("Later", 130.0, 30).starting_at(Utc::now() + Duration::hours(1)),
            )
            .await
            .expect("save");
        assert!(!record.enabled);
        assert!(record.scheduled_at.is_some());
        assert_eq!(engine.pending_schedules().await.len(), 1);

        assert!(engine.delete(&record.id).await.is_committed());
        assert!(engine.pending_schedules().await.is_empty());
    }

    #[tokio::test]
    async fn slider_bounds_follow_policy_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = AdjustmentEngine::new(dir.path().to_path_buf()).expect("engine");
        assert_eq!(engine.slider_bounds(150.0), SliderBounds::neutral());

        engine
            .update_settings(serde_json::json!({ "exerciseMode": true }))
            .expect("settings");
        assert_eq!(engine.slider_bounds(150.0), SliderBounds { low: 15.0, high: 95.0 });
        assert_eq!(engine.slider_bounds(80.0), SliderBounds::neutral());
    }

    #[tokio::test]
    async fn duplicate_without_running_preset_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = AdjustmentEngine::new(dir.path().to_path_buf()).expect("engine");
        assert_eq!(engine.duplicate_active_and_edit(AdjustmentKind::Override).expect("dup"), None);

        engine
            .save_custom(SaveAdjustmentPayload::override_with("Custom", 90.0, 0))
            .await
            .expect("save");
        assert_eq!(engine.duplicate_active_and_edit(AdjustmentKind::Override).expect("dup"), None);
    }
}

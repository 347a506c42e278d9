//! Enable/disable transitions for overrides and temporary targets.
//!
//! At most one record per category is enabled at any committed instant. Every
//! transition runs inside one store transaction and re-resolves ids there, so
//! a record deleted between lookup and mutation is simply skipped.

use crate::db::{AdjustmentFilter, Database, SortKey, StoreTx};
use crate::errors::{AppError, AppResult};
use crate::models::{
    ActiveAdjustment, AdjustmentDraft, AdjustmentKind, AdjustmentRecord, AdjustmentSettings, EffectiveAdjustments,
    OverrideParams, RunRecord, SaveAdjustmentPayload,
};
use crate::sensitivity::{
    compute_adjusted_percentage, compute_half_basal_target, compute_slider_bounds, is_adjustment_eligible,
    round_percentage_to_step, round_target_to_step,
};
use crate::settings::SettingsHub;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Result of a lifecycle transition. Failures are logged, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Committed { audit_id: Option<String> },
    Unchanged,
    NotFound,
    Aborted,
}

impl Transition {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

enum Step {
    Missing,
    Applied {
        kind: AdjustmentKind,
        audit_id: Option<String>,
    },
}

#[derive(Debug, Default)]
struct UiState {
    active: HashMap<AdjustmentKind, ActiveAdjustment>,
    drafts: HashMap<AdjustmentKind, AdjustmentDraft>,
}

pub struct LifecycleController {
    db: Arc<Database>,
    settings: SettingsHub,
    ui_state: RwLock<UiState>,
}

impl LifecycleController {
    pub fn new(db: Arc<Database>, settings: SettingsHub) -> Self {
        let controller = Self {
            db,
            settings,
            ui_state: RwLock::new(UiState::default()),
        };
        for kind in AdjustmentKind::ALL {
            controller.refresh_active(kind);
        }
        controller
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn settings(&self) -> &SettingsHub {
        &self.settings
    }

    /// Activates `id` and disables every other enabled record of its category.
    ///
    /// With `audit_displaced`, the most recently activated displaced record gets
    /// one run record; any further stragglers are disabled silently.
    pub fn enact(&self, id: &str, audit_displaced: bool) -> Transition {
        self.enact_inner(id, audit_displaced, false)
    }

    /// Scheduler entry point: starts a record only while it still waits for
    /// its start time, so a record stopped or started by hand in the meantime
    /// is left alone.
    pub fn enact_scheduled(&self, id: &str) -> Transition {
        self.enact_inner(id, true, true)
    }

    fn enact_inner(&self, id: &str, audit_displaced: bool, require_scheduled: bool) -> Transition {
        let now = Utc::now();
        let result = self.db.run_transaction(|tx| {
            let Some(record) = tx.resolve(id)? else {
                return Ok(Step::Missing);
            };
            if require_scheduled && (record.enabled || record.scheduled_at.is_none()) {
                return Ok(Step::Applied {
                    kind: record.kind,
                    audit_id: None,
                });
            }
            let audit_id = sweep_enabled(tx, record.kind, Some(id), audit_displaced, now)?;
            if record.enabled && record.is_expired(now) {
                // Close the elapsed run before starting a fresh one.
                if let Some(ends_at) = record.ends_at() {
                    tx.insert_run(&run_record_for(&record, ends_at))?;
                }
                tx.deactivate(id)?;
            }
            tx.activate(id, now)?;
            Ok(Step::Applied {
                kind: record.kind,
                audit_id,
            })
        });
        self.finish("enact", Some(id), result)
    }

    /// Disables every enabled record of `kind` except `except_id`.
    pub fn cancel_all(&self, kind: AdjustmentKind, except_id: Option<&str>, create_audit_entry: bool) -> Transition {
        let now = Utc::now();
        let result = self.db.run_transaction(|tx| {
            let audit_id = sweep_enabled(tx, kind, except_id, create_audit_entry, now)?;
            Ok(Step::Applied { kind, audit_id })
        });
        self.finish("cancel_all", except_id, result)
    }

    /// Explicit user stop of the running adjustment of `kind`.
    pub fn stop(&self, kind: AdjustmentKind) -> Transition {
        self.cancel_all(kind, None, true)
    }

    /// Deletes a record; an enabled one is stopped with an audit entry first.
    pub fn delete(&self, id: &str) -> Transition {
        let now = Utc::now();
        let result = self.db.run_transaction(|tx| {
            let Some(record) = tx.resolve(id)? else {
                return Ok(Step::Missing);
            };
            let audit_id = if record.enabled {
                sweep_enabled(tx, record.kind, None, true, now)?
            } else {
                None
            };
            tx.delete_adjustment(id)?;
            Ok(Step::Applied {
                kind: record.kind,
                audit_id,
            })
        });
        self.finish("delete", Some(id), result)
    }

    /// Saves a custom instance and activates it at once, superseding whatever
    /// ran before without an audit entry.
    pub fn save_custom(&self, payload: &SaveAdjustmentPayload) -> AppResult<AdjustmentRecord> {
        let settings = self.settings.current();
        let now = Utc::now();
        let mut record = build_record(payload, false, &settings, now)?;
        record.enabled = true;

        let result = self.db.run_transaction(|tx| {
            sweep_enabled(tx, record.kind, None, false, now)?;
            tx.insert_adjustment(&record)?;
            Ok(())
        });
        if let Err(error) = result {
            tracing::error!(kind = record.kind.as_str(), error = %error, "failed to save custom adjustment");
            return Err(error);
        }

        tracing::info!(adjustment_id = %record.id, kind = record.kind.as_str(), name = %record.name, "custom adjustment enacted");
        self.reset_draft(record.kind);
        self.refresh_active(record.kind);
        Ok(record)
    }

    /// Disables enabled records whose finite duration has run out, writing a
    /// run record that ends at the natural end time. Returns how many expired.
    pub fn expire_elapsed(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0usize;
        for kind in AdjustmentKind::ALL {
            let result = self.db.run_transaction(|tx| {
                let ids = tx.query(kind, &AdjustmentFilter::enabled(), SortKey::ActivatedAt, false, None)?;
                let mut count = 0usize;
                for id in ids {
                    let Some(record) = tx.resolve(&id)? else {
                        continue;
                    };
                    let Some(ends_at) = record.ends_at().filter(|end| *end <= now) else {
                        continue;
                    };
                    tx.insert_run(&run_record_for(&record, ends_at))?;
                    tx.deactivate(&id)?;
                    count += 1;
                }
                Ok(count)
            });
            match result {
                Ok(outcome) if outcome.committed => {
                    tracing::info!(kind = kind.as_str(), count = outcome.value, "expired elapsed adjustments");
                    expired += outcome.value;
                    self.refresh_active(kind);
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(kind = kind.as_str(), error = %error, "failed to expire elapsed adjustments");
                }
            }
        }
        expired
    }

    /// Derived state for the dosing engine. Expired records count as inactive
    /// even before [`Self::expire_elapsed`] has swept them.
    pub fn effective_state(&self, now: DateTime<Utc>) -> AppResult<EffectiveAdjustments> {
        let settings = self.settings.current();
        let override_adjustment = self.current_enabled(AdjustmentKind::Override, now)?
            .map(|record| summarize(&record, &settings, now));
        let temp_target = self.current_enabled(AdjustmentKind::TempTarget, now)?
            .map(|record| summarize(&record, &settings, now));

        let effective_target = temp_target
            .as_ref()
            .and_then(|active| active.target)
            .or_else(|| override_adjustment.as_ref().and_then(|active| active.target));
        let override_percentage = override_adjustment.as_ref().map_or(100.0, |active| active.percentage);
        let temp_target_percentage = temp_target.as_ref().map_or(100.0, |active| active.percentage);

        Ok(EffectiveAdjustments {
            override_adjustment,
            temp_target,
            effective_target,
            effective_percentage: override_percentage * temp_target_percentage / 100.0,
        })
    }

    pub fn active(&self, kind: AdjustmentKind) -> Option<ActiveAdjustment> {
        self.ui_state
            .read()
            .ok()
            .and_then(|state| state.active.get(&kind).cloned())
    }

    pub fn draft(&self, kind: AdjustmentKind) -> AdjustmentDraft {
        self.ui_state
            .read()
            .ok()
            .and_then(|state| state.drafts.get(&kind).cloned())
            .unwrap_or_else(|| AdjustmentDraft::defaults(kind, &self.settings.current()))
    }

    pub fn set_draft(&self, kind: AdjustmentKind, draft: AdjustmentDraft) {
        if let Ok(mut state) = self.ui_state.write() {
            state.drafts.insert(kind, draft);
        }
    }

    pub(crate) fn refresh_active(&self, kind: AdjustmentKind) {
        let settings = self.settings.current();
        let now = Utc::now();
        let active = match self.current_enabled(kind, now) {
            Ok(record) => record.map(|record| summarize(&record, &settings, now)),
            Err(error) => {
                tracing::warn!(kind = kind.as_str(), error = %error, "failed to refresh active adjustment");
                return;
            }
        };
        if let Ok(mut state) = self.ui_state.write() {
            match active {
                Some(active) => state.active.insert(kind, active),
                None => state.active.remove(&kind),
            };
        }
    }

    fn reset_draft(&self, kind: AdjustmentKind) {
        let defaults = AdjustmentDraft::defaults(kind, &self.settings.current());
        if let Ok(mut state) = self.ui_state.write() {
            state.drafts.insert(kind, defaults);
        }
    }

    fn current_enabled(&self, kind: AdjustmentKind, now: DateTime<Utc>) -> AppResult<Option<AdjustmentRecord>> {
        let ids = self
            .db
            .query(kind, &AdjustmentFilter::enabled(), SortKey::ActivatedAt, false, Some(1))?;
        let Some(id) = ids.first() else {
            return Ok(None);
        };
        Ok(self.db.try_resolve(id)?.filter(|record| !record.is_expired(now)))
    }

    fn finish(&self, operation: &str, id: Option<&str>, result: AppResult<crate::db::TransactionOutcome<Step>>) -> Transition {
        let id = id.unwrap_or("-");
        match result {
            Ok(outcome) => match outcome.value {
                Step::Missing => {
                    tracing::info!(operation, adjustment_id = %id, "adjustment no longer exists; nothing to do");
                    Transition::NotFound
                }
                Step::Applied { kind, audit_id } => {
                    if !outcome.committed {
                        tracing::debug!(operation, adjustment_id = %id, "transition produced no changes");
                        return Transition::Unchanged;
                    }
                    tracing::info!(
                        operation,
                        adjustment_id = %id,
                        kind = kind.as_str(),
                        audited = audit_id.is_some(),
                        "adjustment transition committed"
                    );
                    if operation == "enact" {
                        self.reset_draft(kind);
                    }
                    self.refresh_active(kind);
                    Transition::Committed { audit_id }
                }
            },
            Err(error) => {
                tracing::error!(operation, adjustment_id = %id, error = %error, "adjustment transition aborted");
                Transition::Aborted
            }
        }
    }
}

/// Disables the enabled records of `kind` other than `except_id`, newest first.
/// Only the newest one is audited, and only when `audit` is set.
pub(crate) fn sweep_enabled(
    tx: &mut StoreTx<'_>,
    kind: AdjustmentKind,
    except_id: Option<&str>,
    audit: bool,
    now: DateTime<Utc>,
) -> AppResult<Option<String>> {
    let ids = tx.query(
        kind,
        &AdjustmentFilter::enabled().excluding(except_id),
        SortKey::ActivatedAt,
        false,
        None,
    )?;

    let mut audit_id = None;
    for (index, id) in ids.iter().enumerate() {
        let Some(record) = tx.resolve(id)? else {
            continue;
        };
        if index == 0 {
            if audit {
                let end = record.ends_at().map_or(now, |end| end.min(now));
                let run = run_record_for(&record, end);
                tx.insert_run(&run)?;
                audit_id = Some(run.id);
            }
        } else {
            tracing::warn!(adjustment_id = %record.id, kind = kind.as_str(), "disabling straggling enabled adjustment");
        }
        tx.deactivate(id)?;
    }
    Ok(audit_id)
}

pub(crate) fn run_record_for(record: &AdjustmentRecord, end: DateTime<Utc>) -> RunRecord {
    RunRecord {
        id: Uuid::new_v4().to_string(),
        kind: record.kind,
        adjustment_id: record.id.clone(),
        name: record.name.clone(),
        start_date: record.activated_at,
        end_date: end.max(record.activated_at),
        target: record.target,
    }
}

/// Validates a save payload and turns it into a disabled record.
pub(crate) fn build_record(
    payload: &SaveAdjustmentPayload,
    is_preset: bool,
    settings: &AdjustmentSettings,
    now: DateTime<Utc>,
) -> AppResult<AdjustmentRecord> {
    let name = match payload.name.trim() {
        "" if is_preset => {
            return Err(AppError::InvalidInput("presets need a name".to_string()));
        }
        "" => match payload.kind {
            AdjustmentKind::Override => "Custom Override".to_string(),
            AdjustmentKind::TempTarget => "Custom Temp Target".to_string(),
        },
        trimmed => trimmed.to_string(),
    };

    let target = payload
        .target
        .map(|raw| normalize_target(raw, settings))
        .transpose()?;

    let (target, percentage, half_basal_target, override_params) = match payload.kind {
        AdjustmentKind::TempTarget => {
            let target = target.ok_or_else(|| AppError::InvalidInput("temp target needs a target".to_string()))?;
            let (percentage, half_basal) = temp_target_sensitivity(target, payload.percentage, settings)?;
            (Some(target), percentage, Some(half_basal), None)
        }
        AdjustmentKind::Override => {
            let percentage = normalize_percentage(payload.percentage.unwrap_or(100.0), settings)?;
            let params = payload.override_params.clone().unwrap_or_else(|| OverrideParams {
                smb_minutes: Some(settings.default_smb_minutes),
                uam_minutes: Some(settings.default_uam_minutes),
                ..OverrideParams::default()
            });
            if let Some(schedule) = params.smb_schedule {
                if schedule.start_hour > 23 || schedule.end_hour > 24 {
                    return Err(AppError::InvalidInput(format!(
                        "SMB schedule {}..{} is not within a day",
                        schedule.start_hour, schedule.end_hour
                    )));
                }
            }
            (target, percentage, None, Some(params))
        }
    };

    Ok(AdjustmentRecord {
        id: Uuid::new_v4().to_string(),
        kind: payload.kind,
        name,
        created_at: now,
        activated_at: payload.start_at.unwrap_or(now),
        enabled: false,
        is_preset,
        duration_minutes: payload.duration_minutes,
        target,
        percentage,
        half_basal_target,
        override_params,
        position: None,
        sync_pending: true,
        scheduled_at: None,
    })
}

fn normalize_target(raw: f64, settings: &AdjustmentSettings) -> AppResult<f64> {
    if !raw.is_finite() {
        return Err(AppError::InvalidInput("target must be a number".to_string()));
    }
    let target = round_target_to_step(settings.units.to_mgdl(raw).round(), settings.target_step);
    if target < settings.min_target || target > settings.max_target {
        return Err(AppError::InvalidInput(format!(
            "target {} mg/dL lies outside {}..{}",
            target, settings.min_target, settings.max_target
        )));
    }
    Ok(target)
}

fn normalize_percentage(raw: f64, settings: &AdjustmentSettings) -> AppResult<f64> {
    if !raw.is_finite() || raw < settings.min_percentage || raw > settings.max_percentage {
        return Err(AppError::InvalidInput(format!(
            "percentage {} lies outside {}..{}",
            raw, settings.min_percentage, settings.max_percentage
        )));
    }
    Ok(round_percentage_to_step(raw, settings.percentage_step))
}

/// Percentage and half-basal target stored with a temporary target. Without
/// an explicit percentage the configured half-basal default decides it.
fn temp_target_sensitivity(
    target: f64,
    requested: Option<f64>,
    settings: &AdjustmentSettings,
) -> AppResult<(f64, f64)> {
    let eligible = is_adjustment_eligible(
        target,
        settings.normal_target,
        settings.low_target_lowers_sensitivity,
        settings.high_target_raises_sensitivity,
        settings.exercise_mode,
    );
    if !eligible {
        return Ok((100.0, settings.default_half_basal_target));
    }

    let Some(requested) = requested else {
        let percentage = compute_adjusted_percentage(
            settings.default_half_basal_target,
            target,
            settings.normal_target,
            settings.max_sensitivity_ratio,
        );
        return Ok((percentage, settings.default_half_basal_target));
    };

    let percentage = normalize_percentage(requested, settings)?;
    let bounds = compute_slider_bounds(
        target,
        settings.normal_target,
        settings.max_sensitivity_ratio,
        &settings.slider_bounds,
    );
    if !bounds.contains(percentage) {
        return Err(AppError::InvalidInput(format!(
            "percentage {} lies outside {}..{} for target {}",
            percentage, bounds.low, bounds.high, target
        )));
    }
    let half_basal = compute_half_basal_target(
        target,
        percentage,
        settings.normal_target,
        settings.default_half_basal_target,
    );
    Ok((percentage, half_basal))
}

fn summarize(record: &AdjustmentRecord, settings: &AdjustmentSettings, now: DateTime<Utc>) -> ActiveAdjustment {
    let percentage = match (record.kind, record.target) {
        (AdjustmentKind::TempTarget, Some(target))
            if is_adjustment_eligible(
                target,
                settings.normal_target,
                settings.low_target_lowers_sensitivity,
                settings.high_target_raises_sensitivity,
                settings.exercise_mode,
            ) =>
        {
            compute_adjusted_percentage(
                record.half_basal_target.unwrap_or(settings.default_half_basal_target),
                target,
                settings.normal_target,
                settings.max_sensitivity_ratio,
            )
        }
        (AdjustmentKind::TempTarget, _) => 100.0,
        (AdjustmentKind::Override, _) => record.percentage,
    };

    ActiveAdjustment {
        id: record.id.clone(),
        kind: record.kind,
        name: record.name.clone(),
        enabled: record.enabled,
        activated_at: record.activated_at,
        ends_at: record.ends_at(),
        target: record.target,
        percentage,
        smb_suppressed: record
            .override_params
            .as_ref()
            .is_some_and(|params| params.smb_suppressed_at(now, settings.wall_clock_offset(now))),
    }
}

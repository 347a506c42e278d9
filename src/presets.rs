use crate::db::{AdjustmentFilter, SortKey};
use crate::errors::{AppError, AppResult};
use crate::lifecycle::{build_record, sweep_enabled, LifecycleController, Transition};
use crate::models::{AdjustmentKind, AdjustmentRecord, SaveAdjustmentPayload};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Named, ordered templates for overrides and temporary targets.
///
/// A preset row is never edited while it runs: edits go to a non-preset
/// duplicate that takes over the running slot.
#[derive(Clone)]
pub struct PresetManager {
    lifecycle: Arc<LifecycleController>,
}

impl PresetManager {
    pub fn new(lifecycle: Arc<LifecycleController>) -> Self {
        Self { lifecycle }
    }

    /// Presets of `kind` in their 1-based display order.
    pub fn list(&self, kind: AdjustmentKind) -> AppResult<Vec<AdjustmentRecord>> {
        self.lifecycle
            .database()
            .list_adjustments(kind, &AdjustmentFilter::presets(), SortKey::Position, true)
    }

    pub fn save_preset(&self, payload: &SaveAdjustmentPayload) -> AppResult<AdjustmentRecord> {
        let settings = self.lifecycle.settings().current();
        let mut record = build_record(payload, true, &settings, Utc::now())?;

        let outcome = self.lifecycle.database().run_transaction(|tx| {
            record.position = Some(tx.max_position(record.kind)? + 1);
            tx.insert_adjustment(&record)?;
            Ok(())
        });
        if let Err(error) = outcome {
            tracing::error!(kind = payload.kind.as_str(), error = %error, "failed to save preset");
            return Err(error);
        }
        tracing::info!(adjustment_id = %record.id, name = %record.name, position = ?record.position, "preset saved");
        Ok(record)
    }

    /// Rewrites the positions of every preset of `kind` to match `order`.
    /// `order` must name each current preset exactly once.
    pub fn reorder(&self, kind: AdjustmentKind, order: &[String]) -> AppResult<bool> {
        let outcome = self.lifecycle.database().run_transaction(|tx| {
            let current = tx.query(kind, &AdjustmentFilter::presets(), SortKey::Position, true, None)?;
            let current_set = current.iter().collect::<BTreeSet<_>>();
            let requested_set = order.iter().collect::<BTreeSet<_>>();
            if current_set != requested_set || requested_set.len() != order.len() {
                return Err(AppError::InvalidInput(format!(
                    "reorder must list each of the {} {} presets exactly once",
                    current.len(),
                    kind.as_str()
                )));
            }
            for (index, id) in order.iter().enumerate() {
                tx.set_position(id, index as u32 + 1)?;
            }
            Ok(())
        })?;
        Ok(outcome.committed)
    }

    /// Copies the running preset into an enabled non-preset record that keeps
    /// its activation window, and disables the preset without an audit entry.
    /// Returns the id of the copy, which is what the caller edits.
    pub fn duplicate_active_and_edit(&self, preset_id: &str) -> AppResult<String> {
        let outcome = self.lifecycle.database().run_transaction(|tx| {
            let preset = tx
                .resolve(preset_id)?
                .ok_or_else(|| AppError::NotFound(format!("preset {}", preset_id)))?;
            if !preset.is_preset || !preset.enabled {
                return Err(AppError::InvalidInput(format!(
                    "{} is not a running preset",
                    preset.name
                )));
            }

            let duplicate = AdjustmentRecord {
                id: Uuid::new_v4().to_string(),
                created_at: Utc::now(),
                is_preset: false,
                position: None,
                // The running window was already reported through the preset.
                sync_pending: false,
                scheduled_at: None,
                ..preset.clone()
            };

            sweep_enabled(tx, preset.kind, Some(preset_id), false, Utc::now())?;
            tx.deactivate(preset_id)?;
            tx.insert_adjustment(&duplicate)?;
            Ok((preset.kind, duplicate.id))
        })?;

        let (kind, duplicate_id) = outcome.value;
        tracing::info!(preset_id = %preset_id, adjustment_id = %duplicate_id, "running preset duplicated for editing");
        self.lifecycle.refresh_active(kind);
        Ok(duplicate_id)
    }

    /// Applies an edit to a non-preset record and enacts it again.
    pub fn commit_edit(&self, id: &str, payload: &SaveAdjustmentPayload) -> AppResult<AdjustmentRecord> {
        let settings = self.lifecycle.settings().current();
        let edited = build_record(payload, false, &settings, Utc::now())?;

        self.lifecycle.database().run_transaction(|tx| {
            let mut record = tx
                .resolve(id)?
                .ok_or_else(|| AppError::NotFound(format!("adjustment {}", id)))?;
            if record.is_preset {
                return Err(AppError::InvalidInput(format!(
                    "{} is a preset; edit it through update_preset",
                    record.name
                )));
            }
            if record.kind != edited.kind {
                return Err(AppError::InvalidInput("an edit cannot change the adjustment kind".to_string()));
            }
            apply_edit(&mut record, &edited);
            record.sync_pending = true;
            tx.update_adjustment(&record)?;
            Ok(())
        })?;

        match self.lifecycle.enact(id, false) {
            Transition::Aborted => Err(AppError::Persistence(format!("failed to enact edited adjustment {}", id))),
            Transition::NotFound => Err(AppError::NotFound(format!("adjustment {}", id))),
            Transition::Committed { .. } | Transition::Unchanged => {
                self.lifecycle.refresh_active(edited.kind);
                self.lifecycle.database().resolve(id)
            }
        }
    }

    /// Edits a preset. A preset that is running is duplicated first and the
    /// edit lands on the duplicate, which is returned instead of the preset.
    pub fn update_preset(&self, preset_id: &str, payload: &SaveAdjustmentPayload) -> AppResult<AdjustmentRecord> {
        let preset = self.lifecycle.database().resolve(preset_id)?;
        if !preset.is_preset {
            return Err(AppError::InvalidInput(format!("{} is not a preset", preset.name)));
        }
        if preset.enabled {
            let duplicate_id = self.duplicate_active_and_edit(preset_id)?;
            return self.commit_edit(&duplicate_id, payload);
        }

        let settings = self.lifecycle.settings().current();
        let edited = build_record(payload, true, &settings, Utc::now())?;
        let outcome = self.lifecycle.database().run_transaction(|tx| {
            let mut record = tx
                .resolve(preset_id)?
                .ok_or_else(|| AppError::NotFound(format!("preset {}", preset_id)))?;
            if record.enabled {
                return Err(AppError::InvalidInput(format!("{} started while being edited", record.name)));
            }
            apply_edit(&mut record, &edited);
            record.sync_pending = true;
            tx.update_adjustment(&record)?;
            Ok(record)
        })?;
        Ok(outcome.value)
    }

    /// Starts a preset, superseding the running adjustment without an audit entry.
    pub fn enact_preset(&self, preset_id: &str) -> Transition {
        self.lifecycle.enact(preset_id, false)
    }

    /// Deletes a preset, stopping it with an audit entry if it runs, and closes
    /// the gap in the position sequence.
    pub fn delete_preset(&self, preset_id: &str) -> Transition {
        let kind = match self.lifecycle.database().try_resolve(preset_id) {
            Ok(Some(record)) => record.kind,
            Ok(None) => return Transition::NotFound,
            Err(error) => {
                tracing::error!(preset_id = %preset_id, error = %error, "failed to look up preset for deletion");
                return Transition::Aborted;
            }
        };

        let transition = self.lifecycle.delete(preset_id);
        if transition.is_committed() {
            if let Err(error) = self.compact_positions(kind) {
                tracing::warn!(kind = kind.as_str(), error = %error, "failed to compact preset positions");
            }
        }
        transition
    }

    fn compact_positions(&self, kind: AdjustmentKind) -> AppResult<()> {
        self.lifecycle.database().run_transaction(|tx| {
            let ids = tx.query(kind, &AdjustmentFilter::presets(), SortKey::Position, true, None)?;
            for (index, id) in ids.iter().enumerate() {
                tx.set_position(id, index as u32 + 1)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

fn apply_edit(record: &mut AdjustmentRecord, edited: &AdjustmentRecord) {
    record.name = edited.name.clone();
    record.duration_minutes = edited.duration_minutes;
    record.target = edited.target;
    record.percentage = edited.percentage;
    record.half_basal_target = edited.half_basal_target;
    record.override_params = edited.override_params.clone();
}

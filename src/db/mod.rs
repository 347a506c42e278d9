use crate::errors::{AppError, AppResult};
use crate::models::{AdjustmentKind, AdjustmentRecord, AdjustmentSettings, OverrideParams, RunRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const ADJUSTMENT_COLUMNS: &str = "id, kind, name, created_at, activated_at, enabled, is_preset, duration_minutes,
     target, percentage, half_basal_target, override_params_json, position, sync_pending, scheduled_at";

const RUN_COLUMNS: &str = "id, kind, adjustment_id, name, start_date, end_date, target";

/// Row predicate for [`Database::query`]. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdjustmentFilter {
    pub enabled: Option<bool>,
    pub is_preset: Option<bool>,
    pub scheduled: Option<bool>,
    pub exclude_id: Option<String>,
}

impl AdjustmentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn enabled() -> Self {
        Self {
            enabled: Some(true),
            ..Self::default()
        }
    }

    pub fn presets() -> Self {
        Self {
            is_preset: Some(true),
            ..Self::default()
        }
    }

    pub fn scheduled() -> Self {
        Self {
            enabled: Some(false),
            scheduled: Some(true),
            ..Self::default()
        }
    }

    pub fn excluding(mut self, id: Option<&str>) -> Self {
        self.exclude_id = id.map(ToString::to_string);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    ActivatedAt,
    CreatedAt,
    Position,
}

impl SortKey {
    fn column(self) -> &'static str {
        match self {
            Self::ActivatedAt => "activated_at",
            Self::CreatedAt => "created_at",
            Self::Position => "position",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome<T> {
    pub value: T,
    /// False when the body changed nothing and the transaction was rolled back.
    pub committed: bool,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };

        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Ids of the records of `kind` matching `filter`, ordered by `sort`.
    pub fn query(
        &self,
        kind: AdjustmentKind,
        filter: &AdjustmentFilter,
        sort: SortKey,
        ascending: bool,
        limit: Option<u32>,
    ) -> AppResult<Vec<String>> {
        let conn = self.lock()?;
        query_ids(&conn, kind, filter, sort, ascending, limit)
    }

    /// A concurrently deleted id yields `NotFound`; callers treat that as benign.
    pub fn resolve(&self, id: &str) -> AppResult<AdjustmentRecord> {
        self.try_resolve(id)?
            .ok_or_else(|| AppError::NotFound(format!("adjustment {}", id)))
    }

    pub fn try_resolve(&self, id: &str) -> AppResult<Option<AdjustmentRecord>> {
        let conn = self.lock()?;
        resolve_row(&conn, id)
    }

    pub fn list_adjustments(
        &self,
        kind: AdjustmentKind,
        filter: &AdjustmentFilter,
        sort: SortKey,
        ascending: bool,
    ) -> AppResult<Vec<AdjustmentRecord>> {
        let conn = self.lock()?;
        let ids = query_ids(&conn, kind, filter, sort, ascending, None)?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = resolve_row(&conn, &id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Runs `body` in one SQLite transaction. The transaction commits only when
    /// the body changed at least one row; otherwise it is rolled back.
    pub fn run_transaction<T>(
        &self,
        body: impl FnOnce(&mut StoreTx<'_>) -> AppResult<T>,
    ) -> AppResult<TransactionOutcome<T>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut store_tx = StoreTx { tx, changes: 0 };

        let value = body(&mut store_tx)?;

        let StoreTx { tx, changes } = store_tx;
        if changes == 0 {
            tx.rollback()?;
            return Ok(TransactionOutcome {
                value,
                committed: false,
            });
        }
        tx.commit()?;
        Ok(TransactionOutcome {
            value,
            committed: true,
        })
    }

    pub fn insert_adjustment(&self, record: &AdjustmentRecord) -> AppResult<()> {
        self.run_transaction(|tx| tx.insert_adjustment(record))?;
        Ok(())
    }

    pub fn list_runs(&self, kind: AdjustmentKind, limit: u32) -> AppResult<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM adjustment_runs WHERE kind = ?1 ORDER BY end_date DESC, start_date DESC LIMIT ?2"
        ))?;
        let rows = statement.query_map(params![kind.as_str(), limit], parse_run_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn runs_for_adjustment(&self, adjustment_id: &str) -> AppResult<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM adjustment_runs WHERE adjustment_id = ?1 ORDER BY end_date ASC"
        ))?;
        let rows = statement.query_map([adjustment_id], parse_run_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_runs(&self, kind: AdjustmentKind) -> AppResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM adjustment_runs WHERE kind = ?1",
            [kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn pending_uploads(&self, kind: AdjustmentKind) -> AppResult<Vec<AdjustmentRecord>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {ADJUSTMENT_COLUMNS} FROM adjustments
             WHERE kind = ?1 AND sync_pending = 1 ORDER BY activated_at ASC"
        ))?;
        let rows = statement.query_map([kind.as_str()], parse_adjustment_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn mark_uploaded(&self, ids: &[String]) -> AppResult<usize> {
        let outcome = self.run_transaction(|tx| {
            let mut cleared = 0usize;
            for id in ids {
                if tx.clear_sync_pending(id)? {
                    cleared += 1;
                }
            }
            Ok(cleared)
        })?;
        Ok(outcome.value)
    }

    pub fn get_settings(&self) -> AppResult<AdjustmentSettings> {
        let conn = self.lock()?;
        read_settings(&conn)
    }

    /// Merges `update` into the stored settings. Read, merge and write happen
    /// under one lock so concurrent patches never drop each other.
    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AdjustmentSettings> {
        let conn = self.lock()?;
        let current = read_settings(&conn)?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: AdjustmentSettings = serde_json::from_value(merged)
            .map_err(|error| AppError::InvalidInput(format!("settings update rejected: {}", error)))?;
        settings.validate()?;

        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('adjustments', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, format_time(Utc::now())],
        )?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value_json, updated_at) VALUES ('adjustments', ?1, ?2)",
            params![
                serde_json::to_string(&AdjustmentSettings::default())?,
                format_time(Utc::now())
            ],
        )?;
        Ok(())
    }

}

/// Mutation handle passed to [`Database::run_transaction`] bodies.
///
/// Every mutation is written so that a write which would not change the row
/// touches zero rows; the accumulated count decides whether to commit.
pub struct StoreTx<'conn> {
    tx: Transaction<'conn>,
    changes: usize,
}

impl StoreTx<'_> {
    pub fn resolve(&self, id: &str) -> AppResult<Option<AdjustmentRecord>> {
        resolve_row(&self.tx, id)
    }

    pub fn query(
        &self,
        kind: AdjustmentKind,
        filter: &AdjustmentFilter,
        sort: SortKey,
        ascending: bool,
        limit: Option<u32>,
    ) -> AppResult<Vec<String>> {
        query_ids(&self.tx, kind, filter, sort, ascending, limit)
    }

    pub fn has_changes(&self) -> bool {
        self.changes > 0
    }

    pub fn insert_adjustment(&mut self, record: &AdjustmentRecord) -> AppResult<()> {
        let params_json = record
            .override_params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.changes += self.tx.execute(
            &format!(
                "INSERT INTO adjustments ({ADJUSTMENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                record.id,
                record.kind.as_str(),
                record.name,
                format_time(record.created_at),
                format_time(record.activated_at),
                record.enabled,
                record.is_preset,
                record.duration_minutes,
                record.target,
                record.percentage,
                record.half_basal_target,
                params_json,
                record.position,
                record.sync_pending,
                record.scheduled_at.map(format_time),
            ],
        )?;
        Ok(())
    }

    /// Rewrites every mutable column of an existing record. Returns false when
    /// the record is gone or already identical.
    pub fn update_adjustment(&mut self, record: &AdjustmentRecord) -> AppResult<bool> {
        let Some(current) = self.resolve(&record.id)? else {
            return Ok(false);
        };
        if current == *record {
            return Ok(false);
        }
        let params_json = record
            .override_params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let changed = self.tx.execute(
            "UPDATE adjustments SET
               name = ?1, activated_at = ?2, enabled = ?3, is_preset = ?4, duration_minutes = ?5,
               target = ?6, percentage = ?7, half_basal_target = ?8, override_params_json = ?9,
               position = ?10, sync_pending = ?11, scheduled_at = ?12
             WHERE id = ?13",
            params![
                record.name,
                format_time(record.activated_at),
                record.enabled,
                record.is_preset,
                record.duration_minutes,
                record.target,
                record.percentage,
                record.half_basal_target,
                params_json,
                record.position,
                record.sync_pending,
                record.scheduled_at.map(format_time),
                record.id,
            ],
        )?;
        self.changes += changed;
        Ok(changed > 0)
    }

    /// Enables a disabled record, stamping its activation time. No-op when already enabled.
    pub fn activate(&mut self, id: &str, at: DateTime<Utc>) -> AppResult<bool> {
        let changed = self.tx.execute(
            "UPDATE adjustments
             SET enabled = 1, activated_at = ?1, sync_pending = 1, scheduled_at = NULL
             WHERE id = ?2 AND enabled = 0",
            params![format_time(at), id],
        )?;
        self.changes += changed;
        Ok(changed > 0)
    }

    pub fn deactivate(&mut self, id: &str) -> AppResult<bool> {
        let changed = self.tx.execute(
            "UPDATE adjustments SET enabled = 0, sync_pending = 1 WHERE id = ?1 AND enabled = 1",
            [id],
        )?;
        self.changes += changed;
        Ok(changed > 0)
    }

    pub fn set_position(&mut self, id: &str, position: u32) -> AppResult<bool> {
        let changed = self.tx.execute(
            "UPDATE adjustments SET position = ?1 WHERE id = ?2 AND position IS NOT ?1",
            params![position, id],
        )?;
        self.changes += changed;
        Ok(changed > 0)
    }

    pub fn clear_sync_pending(&mut self, id: &str) -> AppResult<bool> {
        let changed = self.tx.execute(
            "UPDATE adjustments SET sync_pending = 0 WHERE id = ?1 AND sync_pending = 1",
            [id],
        )?;
        self.changes += changed;
        Ok(changed > 0)
    }

    pub fn delete_adjustment(&mut self, id: &str) -> AppResult<bool> {
        let changed = self.tx.execute("DELETE FROM adjustments WHERE id = ?1", [id])?;
        self.changes += changed;
        Ok(changed > 0)
    }

    pub fn insert_run(&mut self, run: &RunRecord) -> AppResult<()> {
        self.changes += self.tx.execute(
            &format!("INSERT INTO adjustment_runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                run.id,
                run.kind.as_str(),
                run.adjustment_id,
                run.name,
                format_time(run.start_date),
                format_time(run.end_date),
                run.target,
            ],
        )?;
        Ok(())
    }

    pub fn max_position(&self, kind: AdjustmentKind) -> AppResult<u32> {
        let max: Option<i64> = self.tx.query_row(
            "SELECT MAX(position) FROM adjustments WHERE kind = ?1 AND is_preset = 1",
            [kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0).max(0) as u32)
    }
}

fn query_ids(
    conn: &Connection,
    kind: AdjustmentKind,
    filter: &AdjustmentFilter,
    sort: SortKey,
    ascending: bool,
    limit: Option<u32>,
) -> AppResult<Vec<String>> {
    let mut query = String::from("SELECT id FROM adjustments WHERE kind = ?");
    let mut params_vec: Vec<rusqlite::types::Value> = vec![kind.as_str().to_string().into()];

    if let Some(enabled) = filter.enabled {
        query.push_str(" AND enabled = ?");
        params_vec.push(i64::from(enabled).into());
    }
    if let Some(is_preset) = filter.is_preset {
        query.push_str(" AND is_preset = ?");
        params_vec.push(i64::from(is_preset).into());
    }
    if let Some(scheduled) = filter.scheduled {
        query.push_str(if scheduled {
            " AND scheduled_at IS NOT NULL"
        } else {
            " AND scheduled_at IS NULL"
        });
    }
    if let Some(exclude_id) = &filter.exclude_id {
        query.push_str(" AND id != ?");
        params_vec.push(exclude_id.clone().into());
    }

    let direction = if ascending { "ASC" } else { "DESC" };
    query.push_str(&format!(
        " ORDER BY {column} {direction}, created_at {direction}, id {direction}",
        column = sort.column()
    ));

    if let Some(limit) = limit {
        query.push_str(" LIMIT ?");
        params_vec.push(i64::from(limit).into());
    }

    let mut statement = conn.prepare(&query)?;
    let rows = statement.query_map(rusqlite::params_from_iter(params_vec), |row| row.get::<_, String>(0))?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn resolve_row(conn: &Connection, id: &str) -> AppResult<Option<AdjustmentRecord>> {
    conn.query_row(
        &format!("SELECT {ADJUSTMENT_COLUMNS} FROM adjustments WHERE id = ?1"),
        [id],
        parse_adjustment_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn parse_adjustment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdjustmentRecord> {
    let params_raw: Option<String> = row.get(11)?;
    Ok(AdjustmentRecord {
        id: row.get(0)?,
        kind: parse_kind(&row.get::<_, String>(1)?)?,
        name: row.get(2)?,
        created_at: parse_time(&row.get::<_, String>(3)?)?,
        activated_at: parse_time(&row.get::<_, String>(4)?)?,
        enabled: row.get(5)?,
        is_preset: row.get(6)?,
        duration_minutes: row.get(7)?,
        target: row.get(8)?,
        percentage: row.get(9)?,
        half_basal_target: row.get(10)?,
        override_params: params_raw.and_then(|raw| serde_json::from_str::<OverrideParams>(&raw).ok()),
        position: row.get(12)?,
        sync_pending: row.get(13)?,
        scheduled_at: row
            .get::<_, Option<String>>(14)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
    })
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        kind: parse_kind(&row.get::<_, String>(1)?)?,
        adjustment_id: row.get(2)?,
        name: row.get(3)?,
        start_date: parse_time(&row.get::<_, String>(4)?)?,
        end_date: parse_time(&row.get::<_, String>(5)?)?,
        target: row.get(6)?,
    })
}

fn read_settings(conn: &Connection) -> AppResult<AdjustmentSettings> {
    let raw = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = 'adjustments'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    match raw {
        Some(raw) => Ok(serde_json::from_str::<AdjustmentSettings>(&raw).unwrap_or_default()),
        None => Ok(AdjustmentSettings::default()),
    }
}

fn parse_kind(raw: &str) -> rusqlite::Result<AdjustmentKind> {
    match raw {
        "override" => Ok(AdjustmentKind::Override),
        "temp-target" => Ok(AdjustmentKind::TempTarget),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown adjustment kind: {}", other),
            )),
        )),
    }
}

/// Fixed precision keeps lexical order equal to chronological order.
pub(crate) fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AdjustmentFilter, Database, SortKey};
    use crate::errors::AppError;
    use crate::models::{AdjustmentKind, AdjustmentRecord, GlucoseUnits, OverrideParams, RunRecord};
    use chrono::{Duration, Utc};

    fn record(kind: AdjustmentKind, name: &str, enabled: bool) -> AdjustmentRecord {
        let now = Utc::now();
        AdjustmentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            name: name.to_string(),
            created_at: now,
            activated_at: now,
            enabled,
            is_preset: false,
            duration_minutes: 60,
            target: Some(120.0),
            percentage: 100.0,
            half_basal_target: None,
            override_params: None,
            position: None,
            sync_pending: true,
            scheduled_at: None,
        }
    }

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("test.db")).expect("db");
        (dir, db)
    }

    #[test]
    fn insert_and_resolve_round_trip() {
        let (_dir, db) = open();
        let mut saved = record(AdjustmentKind::Override, "Exercise", false);
        saved.override_params = Some(OverrideParams {
            smb_disabled: true,
            ..OverrideParams::default()
        });
        db.insert_adjustment(&saved).expect("insert");

        let loaded = db.resolve(&saved.id).expect("resolve");
        assert_eq!(loaded.name, "Exercise");
        assert_eq!(loaded.override_params, saved.override_params);
        assert_eq!(
            loaded.activated_at.timestamp_micros(),
            saved.activated_at.timestamp_micros()
        );
    }

    #[test]
    fn resolve_missing_id_is_not_found() {
        let (_dir, db) = open();
        let err = db.resolve("missing").expect_err("missing id");
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(db.try_resolve("missing").expect("try resolve").is_none());
    }

    #[test]
    fn query_filters_and_orders_by_activation() {
        let (_dir, db) = open();
        let mut older = record(AdjustmentKind::TempTarget, "older", true);
        older.activated_at = Utc::now() - Duration::minutes(30);
        let newer = record(AdjustmentKind::TempTarget, "newer", true);
        let disabled = record(AdjustmentKind::TempTarget, "off", false);
        let other_kind = record(AdjustmentKind::Override, "override", true);
        for item in [&older, &newer, &disabled, &other_kind] {
            db.insert_adjustment(item).expect("insert");
        }

        let ids = db
            .query(
                AdjustmentKind::TempTarget,
                &AdjustmentFilter::enabled(),
                SortKey::ActivatedAt,
                false,
                None,
            )
            .expect("query");
        assert_eq!(ids, vec![newer.id.clone(), older.id.clone()]);

        let limited = db
            .query(
                AdjustmentKind::TempTarget,
                &AdjustmentFilter::enabled().excluding(Some(&newer.id)),
                SortKey::ActivatedAt,
                true,
                Some(1),
            )
            .expect("query");
        assert_eq!(limited, vec![older.id]);
    }

    #[test]
    fn transaction_without_diff_is_not_committed() {
        let (_dir, db) = open();
        let saved = record(AdjustmentKind::TempTarget, "running", true);
        db.insert_adjustment(&saved).expect("insert");

        let outcome = db
            .run_transaction(|tx| tx.activate(&saved.id, Utc::now()))
            .expect("transaction");
        assert!(!outcome.value);
        assert!(!outcome.committed);

        let outcome = db
            .run_transaction(|tx| tx.deactivate(&saved.id))
            .expect("transaction");
        assert!(outcome.committed);
        assert!(!db.resolve(&saved.id).expect("resolve").enabled);
    }

    #[test]
    fn failed_body_rolls_back_earlier_mutations() {
        let (_dir, db) = open();
        let saved = record(AdjustmentKind::TempTarget, "running", true);
        db.insert_adjustment(&saved).expect("insert");

        let result = db.run_transaction(|tx| {
            tx.deactivate(&saved.id)?;
            Err::<(), _>(AppError::Persistence("simulated".to_string()))
        });
        assert!(result.is_err());
        assert!(db.resolve(&saved.id).expect("resolve").enabled);
    }

    #[test]
    fn runs_are_listed_newest_first() {
        let (_dir, db) = open();
        let now = Utc::now();
        db.run_transaction(|tx| {
            for (name, offset) in [("first", 60), ("second", 10)] {
                tx.insert_run(&RunRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    kind: AdjustmentKind::TempTarget,
                    adjustment_id: "a".to_string(),
                    name: name.to_string(),
                    start_date: now - Duration::minutes(offset + 30),
                    end_date: now - Duration::minutes(offset),
                    target: Some(140.0),
                })?;
            }
            Ok(())
        })
        .expect("insert runs");

        let runs = db.list_runs(AdjustmentKind::TempTarget, 10).expect("runs");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].name, "second");
        assert_eq!(db.count_runs(AdjustmentKind::Override).expect("count"), 0);
    }

    #[test]
    fn settings_merge_partial_updates() {
        let (_dir, db) = open();
        let updated = db
            .update_settings(serde_json::json!({
                "units": "mmol/L",
                "sliderBounds": { "belowNormalFloor": 110.0 }
            }))
            .expect("update");
        assert_eq!(updated.units, GlucoseUnits::MmolL);
        assert_eq!(updated.slider_bounds.below_normal_floor, 110.0);
        assert_eq!(updated.slider_bounds.above_normal_ceiling, 95.0);
        assert_eq!(db.get_settings().expect("settings"), updated);

        let err = db
            .update_settings(serde_json::json!({ "normalTarget": "high" }))
            .expect_err("invalid type");
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn concurrent_settings_patches_all_land() {
        let (_dir, db) = open();
        let db = std::sync::Arc::new(db);
        let patches = vec![
            serde_json::json!({ "exerciseMode": true }),
            serde_json::json!({ "lowTargetLowersSensitivity": true }),
            serde_json::json!({ "highTargetRaisesSensitivity": true }),
            serde_json::json!({ "defaultSmbMinutes": 45 }),
            serde_json::json!({ "defaultUamMinutes": 50 }),
            serde_json::json!({ "schedulerTickSeconds": 30 }),
        ];
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(patches.len()));
        let handles = patches
            .into_iter()
            .map(|patch| {
                let db = db.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    db.update_settings(patch).expect("update");
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join");
        }

        let settings = db.get_settings().expect("settings");
        assert!(settings.exercise_mode);
        assert!(settings.low_target_lowers_sensitivity);
        assert!(settings.high_target_raises_sensitivity);
        assert_eq!(settings.default_smb_minutes, 45);
        assert_eq!(settings.default_uam_minutes, 50);
        assert_eq!(settings.scheduler_tick_seconds, 30);
    }

    #[test]
    fn scheduled_at_column_is_part_of_the_schema() {
        let (_dir, db) = open();
        let mut item = record(AdjustmentKind::TempTarget, "Later", false);
        let start = Utc::now() + Duration::minutes(30);
        item.scheduled_at = Some(start);
        db.insert_adjustment(&item).expect("insert");
        let stored = db.resolve(&item.id).expect("resolve");
        assert_eq!(stored.scheduled_at.map(|at| at.timestamp_micros()), Some(start.timestamp_micros()));
        assert_eq!(
            db.list_adjustments(AdjustmentKind::TempTarget, &AdjustmentFilter::scheduled(), SortKey::ActivatedAt, true)
                .expect("scheduled")
                .len(),
            1
        );
    }

    #[test]
    fn upload_flags_clear_once() {
        let (_dir, db) = open();
        let saved = record(AdjustmentKind::Override, "sync", false);
        db.insert_adjustment(&saved).expect("insert");
        assert_eq!(db.pending_uploads(AdjustmentKind::Override).expect("pending").len(), 1);
        assert_eq!(db.mark_uploaded(&[saved.id.clone()]).expect("mark"), 1);
        assert_eq!(db.mark_uploaded(&[saved.id]).expect("mark again"), 0);
        assert!(db.pending_uploads(AdjustmentKind::Override).expect("pending").is_empty());
    }
}

use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Duration, FixedOffset, Local, Offset, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const MGDL_PER_MMOLL: f64 = 18.0182;
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdjustmentKind {
    Override,
    TempTarget,
}

impl AdjustmentKind {
    pub const ALL: [AdjustmentKind; 2] = [AdjustmentKind::Override, AdjustmentKind::TempTarget];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::TempTarget => "temp-target",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlucoseUnits {
    #[serde(rename = "mg/dL")]
    MgDl,
    #[serde(rename = "mmol/L")]
    MmolL,
}

impl GlucoseUnits {
    /// Converts a value expressed in these units to mg/dL.
    pub fn to_mgdl(self, value: f64) -> f64 {
        match self {
            Self::MgDl => value,
            Self::MmolL => value * MGDL_PER_MMOLL,
        }
    }

    pub fn from_mgdl(self, value: f64) -> f64 {
        match self {
            Self::MgDl => value,
            Self::MmolL => value / MGDL_PER_MMOLL,
        }
    }
}

/// Wall-clock hours of the day during which super-micro-boluses are suppressed.
/// `end_hour` is exclusive; a window with `start_hour > end_hour` wraps midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmbSchedule {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl SmbSchedule {
    pub fn covers(&self, at: DateTime<Utc>, offset: FixedOffset) -> bool {
        let hour = at.with_timezone(&offset).hour() as u8;
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideParams {
    pub smb_disabled: bool,
    pub smb_schedule: Option<SmbSchedule>,
    pub adjust_isf: bool,
    pub adjust_cr: bool,
    pub smb_minutes: Option<u32>,
    pub uam_minutes: Option<u32>,
}

impl Default for OverrideParams {
    fn default() -> Self {
        Self {
            smb_disabled: false,
            smb_schedule: None,
            adjust_isf: true,
            adjust_cr: true,
            smb_minutes: None,
            uam_minutes: None,
        }
    }
}

impl OverrideParams {
    pub fn smb_suppressed_at(&self, at: DateTime<Utc>, offset: FixedOffset) -> bool {
        self.smb_disabled || self.smb_schedule.is_some_and(|schedule| schedule.covers(at, offset))
    }
}

/// A persisted override or temporary target, either a running instance or a preset template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentRecord {
    pub id: String,
    pub kind: AdjustmentKind,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub activated_at: DateTime<Utc>,
    pub enabled: bool,
    pub is_preset: bool,
    /// Zero means indefinite.
    pub duration_minutes: u32,
    /// Stored in mg/dL regardless of display units.
    pub target: Option<f64>,
    pub percentage: f64,
    pub half_basal_target: Option<f64>,
    pub override_params: Option<OverrideParams>,
    pub position: Option<u32>,
    pub sync_pending: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl AdjustmentRecord {
    pub fn is_indefinite(&self) -> bool {
        self.duration_minutes == 0
    }

    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        if self.is_indefinite() {
            None
        } else {
            Some(self.activated_at + Duration::minutes(i64::from(self.duration_minutes)))
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ends_at().is_some_and(|end| end <= now)
    }
}

/// Immutable audit entry written when an active adjustment is explicitly stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub kind: AdjustmentKind,
    pub adjustment_id: String,
    pub name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub target: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveAdjustmentPayload {
    pub kind: AdjustmentKind,
    pub name: String,
    /// Expressed in the configured display units.
    pub target: Option<f64>,
    pub percentage: Option<f64>,
    #[serde(default)]
    pub duration_minutes: u32,
    pub override_params: Option<OverrideParams>,
    pub start_at: Option<DateTime<Utc>>,
}

impl SaveAdjustmentPayload {
    pub fn temp_target(name: &str, target: f64, duration_minutes: u32) -> Self {
        Self {
            kind: AdjustmentKind::TempTarget,
            name: name.to_string(),
            target: Some(target),
            percentage: None,
            duration_minutes,
            override_params: None,
            start_at: None,
        }
    }

    pub fn override_with(name: &str, percentage: f64, duration_minutes: u32) -> Self {
        Self {
            kind: AdjustmentKind::Override,
            name: name.to_string(),
            target: None,
            percentage: Some(percentage),
            duration_minutes,
            override_params: Some(OverrideParams::default()),
            start_at: None,
        }
    }

    pub fn with_percentage(mut self, percentage: f64) -> Self {
        self.percentage = Some(percentage);
        self
    }

    pub fn starting_at(mut self, start_at: DateTime<Utc>) -> Self {
        self.start_at = Some(start_at);
        self
    }
}

/// Read-only summary of the running adjustment of one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAdjustment {
    pub id: String,
    pub kind: AdjustmentKind,
    pub name: String,
    pub enabled: bool,
    pub activated_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub target: Option<f64>,
    pub percentage: f64,
    pub smb_suppressed: bool,
}

/// What the dosing engine reads once per cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveAdjustments {
    pub override_adjustment: Option<ActiveAdjustment>,
    pub temp_target: Option<ActiveAdjustment>,
    /// mg/dL; a temporary target takes precedence over an override target.
    pub effective_target: Option<f64>,
    pub effective_percentage: f64,
}

/// Ephemeral editor state held by the UI-facing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentDraft {
    pub name: String,
    pub target: Option<f64>,
    pub percentage: f64,
    pub duration_minutes: u32,
    pub half_basal_target: Option<f64>,
    pub override_params: Option<OverrideParams>,
}

impl AdjustmentDraft {
    pub fn defaults(kind: AdjustmentKind, settings: &AdjustmentSettings) -> Self {
        match kind {
            AdjustmentKind::Override => Self {
                name: String::new(),
                target: None,
                percentage: 100.0,
                duration_minutes: 0,
                half_basal_target: None,
                override_params: Some(OverrideParams {
                    smb_minutes: Some(settings.default_smb_minutes),
                    uam_minutes: Some(settings.default_uam_minutes),
                    ..OverrideParams::default()
                }),
            },
            AdjustmentKind::TempTarget => Self {
                name: String::new(),
                target: Some(settings.normal_target),
                percentage: 100.0,
                duration_minutes: 60,
                half_basal_target: Some(settings.default_half_basal_target),
                override_params: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliderBoundsConfig {
    pub below_normal_floor: f64,
    pub above_normal_floor: f64,
    pub above_normal_ceiling: f64,
}

impl Default for SliderBoundsConfig {
    fn default() -> Self {
        Self {
            below_normal_floor: 105.0,
            above_normal_floor: 15.0,
            above_normal_ceiling: 95.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentSettings {
    pub units: GlucoseUnits,
    pub normal_target: f64,
    pub default_half_basal_target: f64,
    pub max_sensitivity_ratio: f64,
    pub low_target_lowers_sensitivity: bool,
    pub high_target_raises_sensitivity: bool,
    pub exercise_mode: bool,
    pub default_smb_minutes: u32,
    pub default_uam_minutes: u32,
    pub min_target: f64,
    pub max_target: f64,
    pub min_percentage: f64,
    pub max_percentage: f64,
    pub percentage_step: f64,
    pub target_step: u32,
    pub slider_bounds: SliderBoundsConfig,
    pub scheduler_tick_seconds: u64,
    /// Offset used to read SMB schedule hours. `None` follows the host time zone.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

impl Default for AdjustmentSettings {
    fn default() -> Self {
        Self {
            units: GlucoseUnits::MgDl,
            normal_target: 100.0,
            default_half_basal_target: 160.0,
            max_sensitivity_ratio: 1.2,
            low_target_lowers_sensitivity: false,
            high_target_raises_sensitivity: false,
            exercise_mode: false,
            default_smb_minutes: 30,
            default_uam_minutes: 30,
            min_target: 80.0,
            max_target: 270.0,
            min_percentage: 10.0,
            max_percentage: 200.0,
            percentage_step: 5.0,
            target_step: 1,
            slider_bounds: SliderBoundsConfig::default(),
            scheduler_tick_seconds: 60,
            utc_offset_minutes: None,
        }
    }
}

impl AdjustmentSettings {
    pub fn validate(&self) -> AppResult<()> {
        if !(self.min_target > 0.0 && self.min_target < self.max_target) {
            return Err(AppError::InvalidInput(format!(
                "target bounds {}..{} are not an increasing positive range",
                self.min_target, self.max_target
            )));
        }
        if self.normal_target < self.min_target || self.normal_target > self.max_target {
            return Err(AppError::InvalidInput(format!(
                "normal target {} lies outside {}..{}",
                self.normal_target, self.min_target, self.max_target
            )));
        }
        if !(self.min_percentage > 0.0 && self.min_percentage < self.max_percentage) {
            return Err(AppError::InvalidInput(format!(
                "percentage bounds {}..{} are not an increasing positive range",
                self.min_percentage, self.max_percentage
            )));
        }
        if !(self.max_sensitivity_ratio.is_finite() && self.max_sensitivity_ratio > 0.0) {
            return Err(AppError::InvalidInput(
                "max sensitivity ratio must be positive".to_string(),
            ));
        }
        if self.percentage_step.is_nan() || self.percentage_step <= 0.0 || self.target_step == 0 {
            return Err(AppError::InvalidInput("rounding steps must be positive".to_string()));
        }
        if self.scheduler_tick_seconds == 0 || self.scheduler_tick_seconds > 60 {
            return Err(AppError::InvalidInput(format!(
                "scheduler tick {}s must be within 1..=60",
                self.scheduler_tick_seconds
            )));
        }
        if let Some(minutes) = self.utc_offset_minutes {
            if minutes.abs() > MAX_UTC_OFFSET_MINUTES {
                return Err(AppError::InvalidInput(format!(
                    "UTC offset {minutes} min lies outside ±{MAX_UTC_OFFSET_MINUTES}"
                )));
            }
        }
        Ok(())
    }

    /// Wall-clock offset in effect at `at`.
    pub fn wall_clock_offset(&self, at: DateTime<Utc>) -> FixedOffset {
        match self.utc_offset_minutes {
            Some(minutes) => FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix()),
            None => Local.offset_from_utc_datetime(&at.naive_utc()).fix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AdjustmentKind, AdjustmentSettings, GlucoseUnits, OverrideParams, SmbSchedule};
    use chrono::{FixedOffset, TimeZone, Utc};

    #[test]
    fn smb_schedule_wraps_midnight() {
        let schedule = SmbSchedule {
            start_hour: 22,
            end_hour: 6,
        };
        let utc = FixedOffset::east_opt(0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 23, 10, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 5, 59, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(schedule.covers(late, utc));
        assert!(schedule.covers(early, utc));
        assert!(!schedule.covers(noon, utc));

        let params = OverrideParams {
            smb_schedule: Some(schedule),
            ..OverrideParams::default()
        };
        assert!(params.smb_suppressed_at(late, utc));
        assert!(!params.smb_suppressed_at(noon, utc));
    }

    #[test]
    fn smb_schedule_uses_wall_clock_hours() {
        let schedule = SmbSchedule {
            start_hour: 22,
            end_hour: 6,
        };
        let settings = AdjustmentSettings {
            utc_offset_minutes: Some(-5 * 60),
            ..AdjustmentSettings::default()
        };
        // 23:30 UTC is 18:30 at UTC-5; 04:00 UTC is 23:00 there.
        let evening = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2026, 3, 2, 4, 0, 0).unwrap();
        assert!(!schedule.covers(evening, settings.wall_clock_offset(evening)));
        assert!(schedule.covers(night, settings.wall_clock_offset(night)));

        let settings = AdjustmentSettings {
            utc_offset_minutes: Some(15 * 60),
            ..AdjustmentSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn mmol_conversion_is_symmetric() {
        let mgdl = GlucoseUnits::MmolL.to_mgdl(5.5);
        assert!((mgdl - 99.1).abs() < 0.1);
        assert!((GlucoseUnits::MmolL.from_mgdl(mgdl) - 5.5).abs() < 1e-9);
        assert_eq!(GlucoseUnits::MgDl.to_mgdl(120.0), 120.0);
    }

    #[test]
    fn default_settings_validate() {
        AdjustmentSettings::default().validate().expect("defaults are valid");
        let settings = AdjustmentSettings {
            scheduler_tick_seconds: 120,
            ..AdjustmentSettings::default()
        };
        assert!(settings.validate().is_err());
        let settings = AdjustmentSettings {
            normal_target: 300.0,
            ..AdjustmentSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn kind_serializes_kebab_case() {
        let raw = serde_json::to_string(&AdjustmentKind::TempTarget).expect("serialize");
        assert_eq!(raw, "\"temp-target\"");
        assert_eq!(AdjustmentKind::TempTarget.as_str(), "temp-target");
    }
}

use crate::db;
use crate::period::Granularity;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

const SETTINGS_KEY: &str = "engine.config";

/// Tunables recognized by the aggregation engine. Institutions adjust the
/// engagement weighting and freeze window; everything has a working default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub engagement_weight_present: f64,
    pub engagement_weight_excused_adjustment: f64,
    pub rollup_freeze_window_days: i64,
    pub trend_granularity: Granularity,
    pub apply_lock_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engagement_weight_present: 0.7,
            engagement_weight_excused_adjustment: 0.3,
            rollup_freeze_window_days: 120,
            trend_granularity: Granularity::Week,
            apply_lock_timeout_ms: 250,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (key, v) in [
            ("engagementWeightPresent", self.engagement_weight_present),
            (
                "engagementWeightExcusedAdjustment",
                self.engagement_weight_excused_adjustment,
            ),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(format!("{} must be a non-negative number", key));
            }
        }
        if self.rollup_freeze_window_days < 0 {
            return Err("rollupFreezeWindowDays must be >= 0".to_string());
        }
        if self.apply_lock_timeout_ms == 0 {
            return Err("applyLockTimeoutMs must be >= 1".to_string());
        }
        Ok(())
    }
}

pub fn load(conn: &Connection) -> anyhow::Result<EngineConfig> {
    match db::settings_get_json(conn, SETTINGS_KEY)? {
        Some(v) => Ok(serde_json::from_value(v)?),
        None => Ok(EngineConfig::default()),
    }
}

pub fn save(conn: &Connection, config: &EngineConfig) -> anyhow::Result<()> {
    db::settings_set_json(conn, SETTINGS_KEY, &serde_json::to_value(config)?)
}

/// Shallow-merge a partial update onto `current`. Unknown keys are rejected
/// so a typo'd option never silently no-ops.
pub fn merged(current: &EngineConfig, patch: &serde_json::Value) -> Result<EngineConfig, String> {
    let Some(fields) = patch.as_object() else {
        return Err("config patch must be an object".to_string());
    };
    let mut value = serde_json::to_value(current).map_err(|e| e.to_string())?;
    let obj = value.as_object_mut().expect("config serializes to object");
    for (key, v) in fields {
        if !obj.contains_key(key) {
            return Err(format!("unrecognized option: {}", key));
        }
        obj.insert(key.clone(), v.clone());
    }
    let next: EngineConfig = serde_json::from_value(value)
        .map_err(|e| format!("invalid config value: {}", e))?;
    next.validate()?;
    Ok(next)
}

//! Recognised configuration options (spec section "Configuration").
//!
//! Layering follows the small `Default`-seeded struct pattern used
//! throughout this codebase (e.g. `DuressPinSpec`): a `Config::default()`
//! carries the literal defaults, and `Config::from_json` lets a caller
//! overlay deployment-time tuning without a bespoke config-file format.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub replay_window_seconds: i64,
    pub skip_window_size: usize,
    pub skip_key_ttl_days: i64,
    pub send_max_attempts: u32,
    pub send_backoff_base_ms: u64,
    pub send_backoff_cap_ms: u64,
    pub jitter_fraction: f64,
    pub pong_deadline_ms: u64,
    pub msg_ack_deadline_ms: u64,
    pub connection_reuse_max_age_ms: u64,
    pub device_protection_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replay_window_seconds: 300,
            skip_window_size: 1000,
            skip_key_ttl_days: 30,
            send_max_attempts: 8,
            send_backoff_base_ms: 2_000,
            send_backoff_cap_ms: 300_000,
            jitter_fraction: 0.25,
            pong_deadline_ms: 25_000,
            msg_ack_deadline_ms: 30_000,
            connection_reuse_max_age_ms: 30_000,
            device_protection_enabled: false,
        }
    }
}

impl Config {
    /// Overlay a JSON document of recognised options on top of the defaults.
    /// Unknown keys are ignored; missing keys keep their default value.
    pub fn from_json_overlay(json: &str) -> serde_json::Result<Self> {
        let base = serde_json::to_value(Config::default())?;
        let overlay: serde_json::Value = serde_json::from_str(json)?;
        let mut merged = base;
        if let (Some(base_map), Some(overlay_map)) = (merged.as_object_mut(), overlay.as_object())
        {
            for (k, v) in overlay_map {
                base_map.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.replay_window_seconds, 300);
        assert_eq!(c.skip_window_size, 1000);
        assert_eq!(c.skip_key_ttl_days, 30);
        assert_eq!(c.send_max_attempts, 8);
    }

    #[test]
    fn overlay_keeps_unspecified_defaults() {
        let c = Config::from_json_overlay(r#"{"send_max_attempts": 3}"#).unwrap();
        assert_eq!(c.send_max_attempts, 3);
        assert_eq!(c.replay_window_seconds, 300);
    }
}

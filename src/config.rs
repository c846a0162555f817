//! Engine configuration.
//!
//! All figures that deployments disagree on (cache TTLs, grace period, merge
//! radius) are configuration with documented defaults. Configs are plain
//! structs with `Default`, and can also be loaded from TOML:
//!
//! ```toml
//! [cache]
//! short_ttl_secs = 30.0
//! long_ttl_secs = 600.0
//!
//! [gate]
//! max_calls_per_second = 5
//!
//! [session]
//! grace_period_secs = 30.0
//! merge_radius = 150.0
//!
//! [zones.gate]
//! kind = "band"
//! axis = "y"
//! min = 300.0
//! max = 500.0
//!
//! [[zones.lines]]
//! name = "door"
//! start = [0.0, 400.0]
//! end = [1920.0, 400.0]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::zone::{CrossingLine, Region};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub gate: GateConfig,
    pub session: SessionConfig,
    pub zones: ZoneConfig,
}

/// Verification cache TTL classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for unresolved results, so a failed or unknown track is retried soon.
    pub short_ttl_secs: f64,
    /// TTL for confirmed matches. Sources cite both 5 and 10 minutes.
    pub long_ttl_secs: f64,
    /// Results below this confidence (0-100) are treated as unresolved.
    pub min_match_confidence: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            short_ttl_secs: 30.0,
            long_ttl_secs: 600.0,
            min_match_confidence: 60.0,
        }
    }
}

impl CacheConfig {
    pub fn short_ttl(&self) -> Duration {
        duration_secs(self.short_ttl_secs)
    }

    pub fn long_ttl(&self) -> Duration {
        duration_secs(self.long_ttl_secs)
    }
}

/// External call admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Ceiling of external calls in any rolling one-second window. Match it
    /// to the verification service's own server-side limit.
    pub max_calls_per_second: u32,
    pub call_timeout_secs: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_calls_per_second: 5,
            call_timeout_secs: 3.0,
        }
    }
}

impl GateConfig {
    pub fn call_timeout(&self) -> Duration {
        duration_secs(self.call_timeout_secs)
    }
}

/// Session lifetime and reappearance merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which the reaper closes a session.
    pub grace_period_secs: f64,
    /// Maximum centroid distance, in pixels, for a reappearance merge.
    /// Resolution dependent.
    pub merge_radius: f32,
    /// Maximum time since a session's last activity for a reappearance merge.
    pub merge_window_secs: f64,
    /// Minimum time an open session must go unseen before another track may
    /// take it over. Shorter gaps are detector misses on a still-live track.
    pub min_idle_secs: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 30.0,
            merge_radius: 150.0,
            merge_window_secs: 60.0,
            min_idle_secs: 1.0,
        }
    }
}

impl SessionConfig {
    pub fn grace_period(&self) -> Duration {
        duration_secs(self.grace_period_secs)
    }

    pub fn merge_window(&self) -> Duration {
        duration_secs(self.merge_window_secs)
    }

    pub fn min_idle(&self) -> Duration {
        duration_secs(self.min_idle_secs)
    }
}

/// Gate region and counting lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    /// Region inside which verification is requested. `None` means the whole frame.
    pub gate: Option<Region>,
    pub lines: Vec<CrossingLine>,
    /// Offsets within this distance of a line keep the previous side.
    pub crossing_deadband: f32,
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("cache.short_ttl_secs", self.cache.short_ttl_secs)?;
        positive("cache.long_ttl_secs", self.cache.long_ttl_secs)?;
        if !(0.0..=100.0).contains(&self.cache.min_match_confidence) {
            return Err(ConfigError::invalid(
                "cache.min_match_confidence",
                "must be within 0..=100",
            ));
        }
        if self.gate.max_calls_per_second == 0 {
            return Err(ConfigError::invalid(
                "gate.max_calls_per_second",
                "must admit at least one call per second",
            ));
        }
        positive("gate.call_timeout_secs", self.gate.call_timeout_secs)?;
        positive("session.grace_period_secs", self.session.grace_period_secs)?;
        positive("session.merge_window_secs", self.session.merge_window_secs)?;
        if !(self.session.min_idle_secs.is_finite()
            && (0.0..self.session.merge_window_secs).contains(&self.session.min_idle_secs))
        {
            return Err(ConfigError::invalid(
                "session.min_idle_secs",
                "must be non-negative and shorter than session.merge_window_secs",
            ));
        }
        if !(self.session.merge_radius.is_finite() && self.session.merge_radius >= 0.0) {
            return Err(ConfigError::invalid(
                "session.merge_radius",
                "must be a finite, non-negative distance",
            ));
        }
        if !(self.zones.crossing_deadband.is_finite() && self.zones.crossing_deadband >= 0.0) {
            return Err(ConfigError::invalid(
                "zones.crossing_deadband",
                "must be a finite, non-negative distance",
            ));
        }
        if let Some(region) = &self.zones.gate {
            region
                .validate()
                .map_err(|reason| ConfigError::invalid("zones.gate", reason))?;
        }
        for line in &self.zones.lines {
            line.validate()
                .map_err(|reason| ConfigError::invalid("zones.lines", reason))?;
        }
        Ok(())
    }
}

/// Upper bound for every configured duration (one year).
const MAX_DURATION_SECS: f64 = 365.0 * 24.0 * 3600.0;

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= MAX_DURATION_SECS {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("must be positive and at most {MAX_DURATION_SECS} seconds, got {value}"),
        ))
    }
}

/// Seconds to `Duration`, clamped so an unvalidated config can never panic.
fn duration_secs(value: f64) -> Duration {
    if value.is_finite() {
        Duration::from_secs_f64(value.clamp(0.0, MAX_DURATION_SECS))
    } else if value > 0.0 {
        Duration::from_secs_f64(MAX_DURATION_SECS)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::Axis;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cache.short_ttl(), Duration::from_secs(30));
        assert_eq!(config.cache.long_ttl(), Duration::from_secs(600));
        assert_eq!(config.session.grace_period(), Duration::from_secs(30));
        assert_eq!(config.session.merge_radius, 150.0);
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [cache]
            long_ttl_secs = 300.0

            [gate]
            max_calls_per_second = 2

            [zones.gate]
            kind = "band"
            axis = "y"
            min = 100.0
            max = 200.0

            [[zones.lines]]
            name = "door"
            start = [0.0, 50.0]
            end = [640.0, 50.0]
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.long_ttl_secs, 300.0);
        assert_eq!(config.cache.short_ttl_secs, 30.0);
        assert_eq!(config.gate.max_calls_per_second, 2);
        assert_eq!(
            config.zones.gate,
            Some(Region::Band {
                axis: Axis::Y,
                min: 100.0,
                max: 200.0
            })
        );
        assert_eq!(config.zones.lines.len(), 1);
        assert_eq!(config.zones.lines[0].name, "door");
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = EngineConfig::from_toml_str("[session]\ngrace_period_secs = 0.0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "session.grace_period_secs",
                ..
            }
        ));

        let err = EngineConfig::from_toml_str("[cache]\nmin_match_confidence = 140.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_rejects_degenerate_polygon() {
        let err = EngineConfig::from_toml_str(
            r#"
            [zones.gate]
            kind = "polygon"
            points = [[0.0, 0.0], [1.0, 1.0]]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "zones.gate", .. }));
    }

    #[test]
    fn test_rejects_zero_ceiling() {
        let err = EngineConfig::from_toml_str("[gate]\nmax_calls_per_second = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "gate.max_calls_per_second",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_out_of_range_durations() {
        let err = EngineConfig::from_toml_str("[cache]\nlong_ttl_secs = 1e20\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "cache.long_ttl_secs",
                ..
            }
        ));

        let err = EngineConfig::from_toml_str("[session]\nmin_idle_secs = 90.0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "session.min_idle_secs",
                ..
            }
        ));

        // Getters clamp rather than panic on a config that skipped validation.
        let unchecked = CacheConfig {
            long_ttl_secs: 1e20,
            short_ttl_secs: f64::NAN,
            ..CacheConfig::default()
        };
        assert_eq!(unchecked.long_ttl(), Duration::from_secs(365 * 24 * 3600));
        assert_eq!(unchecked.short_ttl(), Duration::ZERO);
    }

    #[test]
    fn test_parse_error() {
        let err = EngineConfig::from_toml_str("[cache\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}

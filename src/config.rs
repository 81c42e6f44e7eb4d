use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub upstream_base_url: String,
    pub database_url: String,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_route_refresh_hours")]
    pub route_refresh_hours: u64,
    #[serde(default = "default_position_retention_days")]
    pub position_retention_days: u32,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    #[serde(default)]
    pub tuning: TuningConfig,
}

fn default_poll_interval_seconds() -> u64 {
    10
}

fn default_route_refresh_hours() -> u64 {
    1
}

fn default_position_retention_days() -> u32 {
    90
}

/// The stop-detector / route-matcher heuristic constants, exposed so an
/// operator can retune them without a code change. Defaults match the
/// literal values the detection pipeline was designed around.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub max_snap_distance_m: f64,
    pub max_apply_snap_distance_m: f64,
    pub max_final_snap_error_m: f64,
    pub section_bound_radius_m: f64,
    pub equal_probe_epsilon_m: f64,
    pub min_probe_m: f64,
    pub probe_fraction: f64,
    pub course_penalty: f64,
    pub stickiness_penalty: f64,
    pub max_eta_seconds: i64,
    pub ghost_ttl_seconds: i64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            max_snap_distance_m: 300.0,
            max_apply_snap_distance_m: 60.0,
            max_final_snap_error_m: 80.0,
            section_bound_radius_m: 120.0,
            equal_probe_epsilon_m: 5.0,
            min_probe_m: 5.0,
            probe_fraction: 0.35,
            course_penalty: 500_000.0,
            stickiness_penalty: 200_000.0,
            max_eta_seconds: 3600,
            ghost_ttl_seconds: 120,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_defaults_match_spec_constants() {
        let t = TuningConfig::default();
        assert_eq!(t.max_snap_distance_m, 300.0);
        assert_eq!(t.max_apply_snap_distance_m, 60.0);
        assert_eq!(t.max_final_snap_error_m, 80.0);
        assert_eq!(t.course_penalty, 500_000.0);
        assert_eq!(t.stickiness_penalty, 200_000.0);
        assert_eq!(t.max_eta_seconds, 3600);
        assert_eq!(t.ghost_ttl_seconds, 120);
    }

    #[test]
    fn load_missing_file_is_read_error() {
        let err = Config::load("/nonexistent/path/config.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }
}

use std::{
    fs, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

pub const BUILTIN_SERVER_CONFIG: &str = include_str!("data/server_config.json");

/// Process configuration for the world server.
///
/// Every field has a default, so a config file only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub tick_duration_ms: u64,
    pub bind_addr: SocketAddr,
    pub grid_width: u32,
    pub grid_height: u32,
    /// Chance that a generated cell becomes a spawn point.
    pub spawn_probability: f64,
    /// Chance, after the spawn roll fails, that a cell becomes a power node.
    pub power_node_probability: f64,
    pub world_seed: Option<u64>,
    pub spawn: SpawnDefaults,
    pub power_node_energy_per_tick: u32,
    pub robot: RobotDefaults,
    pub data_path: PathBuf,
    /// Wipe the store before loading. Development servers start from a fresh world.
    pub reset_on_start: bool,
    pub persistence_backoff: BackoffConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_duration_ms: 1000,
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            grid_width: 100,
            grid_height: 100,
            spawn_probability: 0.001,
            power_node_probability: 0.024,
            world_seed: None,
            spawn: SpawnDefaults::default(),
            power_node_energy_per_tick: 10,
            robot: RobotDefaults::default(),
            data_path: PathBuf::from("data/world.bin"),
            reset_on_start: false,
            persistence_backoff: BackoffConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn builtin() -> Self {
        serde_json::from_str(BUILTIN_SERVER_CONFIG).expect("builtin server config should parse")
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_duration_ms == 0 {
            return Err(ConfigError::Invalid("tick_duration_ms must be positive"));
        }
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err(ConfigError::Invalid("grid dimensions must be positive"));
        }
        let in_unit = |p: f64| (0.0..=1.0).contains(&p);
        if !in_unit(self.spawn_probability) || !in_unit(self.power_node_probability) {
            return Err(ConfigError::Invalid("probabilities must lie in [0, 1]"));
        }
        if self.spawn_probability + self.power_node_probability > 1.0 {
            return Err(ConfigError::Invalid(
                "spawn_probability + power_node_probability exceeds 1",
            ));
        }
        if self.persistence_backoff.initial_ticks == 0
            || self.persistence_backoff.max_ticks < self.persistence_backoff.initial_ticks
        {
            return Err(ConfigError::Invalid(
                "persistence_backoff needs 0 < initial_ticks <= max_ticks",
            ));
        }
        Ok(())
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_duration_ms)
    }

    pub fn generation(&self) -> GenerationParams {
        GenerationParams {
            width: self.grid_width,
            height: self.grid_height,
            spawn_probability: self.spawn_probability,
            power_node_probability: self.power_node_probability,
            spawn: self.spawn.clone(),
            power_node_energy_per_tick: self.power_node_energy_per_tick,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse server config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read server config from {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid server config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SpawnDefaults {
    pub cooldown_amount: u64,
    pub energy_required: u32,
}

impl Default for SpawnDefaults {
    fn default() -> Self {
        Self {
            cooldown_amount: 10,
            energy_required: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RobotDefaults {
    pub health: u32,
    pub energy: u32,
}

impl Default for RobotDefaults {
    fn default() -> Self {
        Self {
            health: 100,
            energy: 50,
        }
    }
}

/// Retry spacing, in ticks, for saves after a persistence failure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ticks: u64,
    pub max_ticks: u64,
}

impl BackoffConfig {
    /// Ticks to wait after the given number of consecutive failures.
    pub fn delay_after(&self, failures: u32) -> u64 {
        let doublings = failures.saturating_sub(1).min(63);
        self.initial_ticks
            .saturating_mul(1u64 << doublings)
            .min(self.max_ticks)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ticks: 1,
            max_ticks: 32,
        }
    }
}

/// Inputs for procedural world generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub width: u32,
    pub height: u32,
    pub spawn_probability: f64,
    pub power_node_probability: f64,
    pub spawn: SpawnDefaults,
    pub power_node_energy_per_tick: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_matches_defaults() {
        assert_eq!(ServerConfig::builtin(), ServerConfig::default());
        assert!(ServerConfig::builtin().validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let config =
            ServerConfig::from_json_str(r#"{ "grid_width": 12, "tick_duration_ms": 250 }"#)
                .unwrap();
        assert_eq!(config.grid_width, 12);
        assert_eq!(config.grid_height, 100);
        assert_eq!(config.tick_duration(), Duration::from_millis(250));
        assert_eq!(config.robot, RobotDefaults::default());
    }

    #[test]
    fn rejects_probability_mass_above_one() {
        let err = ServerConfig::from_json_str(
            r#"{ "spawn_probability": 0.6, "power_node_probability": 0.5 }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_empty_grid() {
        let err = ServerConfig::from_json_str(r#"{ "grid_height": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ServerConfig::from_file(Path::new("/nonexistent/server.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/server.json"));
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let backoff = BackoffConfig {
            initial_ticks: 2,
            max_ticks: 10,
        };
        assert_eq!(backoff.delay_after(1), 2);
        assert_eq!(backoff.delay_after(2), 4);
        assert_eq!(backoff.delay_after(3), 8);
        assert_eq!(backoff.delay_after(4), 10);
        assert_eq!(backoff.delay_after(200), 10);
    }
}

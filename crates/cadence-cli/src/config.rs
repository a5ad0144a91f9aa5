//! Demo configuration – reads/writes `~/.cadence/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use cadence_runtime::{ObservationPolicy, StandaloneConfig};
use cadence_types::{CadenceError, ChannelLayout};
use serde::{Deserialize, Serialize};

/// Persisted demo configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Name of the channel the simulated executor binds.
    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default = "default_nb_actuators")]
    pub nb_actuators: usize,

    /// Capacity of every stream of the channel.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_frequency_hz")]
    pub frequency_hz: f64,

    /// Run the executor in bursting mode instead of at `frequency_hz`.
    #[serde(default)]
    pub bursting: bool,

    #[serde(default = "default_true")]
    pub publish_reapplied: bool,

    #[serde(default = "default_true")]
    pub sensor_counts_reapplied: bool,

    /// Target of actuator 0; actuator `n` goes to `(n + 1) * demo_target`.
    #[serde(default = "default_demo_target")]
    pub demo_target: f64,

    #[serde(default = "default_demo_duration_ms")]
    pub demo_duration_ms: u64,

    /// Give up on the demo after this long.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

fn default_channel() -> String {
    "cadence-demo".to_string()
}
fn default_nb_actuators() -> usize {
    2
}
fn default_queue_size() -> usize {
    5_000
}
fn default_frequency_hz() -> f64 {
    1_000.0
}
fn default_true() -> bool {
    true
}
fn default_demo_target() -> f64 {
    1.0
}
fn default_demo_duration_ms() -> u64 {
    500
}
fn default_wait_timeout_ms() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            nb_actuators: default_nb_actuators(),
            queue_size: default_queue_size(),
            frequency_hz: default_frequency_hz(),
            bursting: false,
            publish_reapplied: true,
            sensor_counts_reapplied: true,
            demo_target: default_demo_target(),
            demo_duration_ms: default_demo_duration_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl Config {
    pub fn standalone(&self) -> StandaloneConfig {
        StandaloneConfig {
            layout: ChannelLayout::new(self.queue_size, self.nb_actuators),
            frequency_hz: self.frequency_hz,
            bursting: self.bursting,
            policy: ObservationPolicy {
                publish_reapplied: self.publish_reapplied,
                sensor_counts_reapplied: self.sensor_counts_reapplied,
            },
        }
    }
}

/// `$CADENCE_CONFIG`, or `~/.cadence/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CADENCE_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".cadence").join("config.toml")
}

/// Load the config from disk. `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, CadenceError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, CadenceError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| CadenceError::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| CadenceError::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `CADENCE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CADENCE_CHANNEL` | `channel` |
/// | `CADENCE_FREQUENCY_HZ` | `frequency_hz` |
/// | `CADENCE_BURSTING` | `bursting` |
/// | `CADENCE_QUEUE_SIZE` | `queue_size` |
///
/// Unparsable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CADENCE_CHANNEL") {
        cfg.channel = v;
    }
    if let Ok(v) = std::env::var("CADENCE_FREQUENCY_HZ")
        && let Ok(hz) = v.parse::<f64>()
    {
        cfg.frequency_hz = hz;
    }
    if let Ok(v) = std::env::var("CADENCE_BURSTING")
        && let Ok(bursting) = v.parse::<bool>()
    {
        cfg.bursting = bursting;
    }
    if let Ok(v) = std::env::var("CADENCE_QUEUE_SIZE")
        && let Ok(size) = v.parse::<usize>()
    {
        cfg.queue_size = size;
    }
}

/// Save the config, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), CadenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CadenceError::Config(format!("failed to create config directory: {e}")))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| CadenceError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| CadenceError::Config(format!("failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path)?;

        let loaded = load_from(&path)?.ok_or("config missing")?;
        assert_eq!(loaded.nb_actuators, 2);
        assert_eq!(loaded.queue_size, 5_000);
        assert_eq!(loaded.demo_duration_ms, 500);
        Ok(())
    }

    #[test]
    fn missing_fields_take_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("partial.toml");
        fs::write(&path, "nb_actuators = 6\nbursting = true\n")?;

        let loaded = load_from(&path)?.ok_or("config missing")?;
        assert_eq!(loaded.nb_actuators, 6);
        assert!(loaded.bursting);
        assert_eq!(loaded.wait_timeout_ms, 5_000);
        assert_eq!(loaded.standalone().layout, ChannelLayout::new(5_000, 6));
        Ok(())
    }

    #[test]
    fn malformed_file_is_a_config_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.toml");
        fs::write(&path, "frequency_hz = \"fast\"")?;
        assert!(matches!(load_from(&path), Err(CadenceError::Config(_))));
        Ok(())
    }

    #[test]
    fn load_from_returns_none_when_missing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path)?.is_none());
        Ok(())
    }

    #[test]
    fn config_path_points_to_cadence_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".cadence"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn env_overrides_channel() {
        // SAFETY: each test touches its own variable.
        unsafe { std::env::set_var("CADENCE_CHANNEL", "arm") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.channel, "arm");
        unsafe { std::env::remove_var("CADENCE_CHANNEL") };
    }

    #[test]
    fn env_overrides_bursting() {
        // SAFETY: each test touches its own variable.
        unsafe { std::env::set_var("CADENCE_BURSTING", "true") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!(cfg.bursting);
        unsafe { std::env::remove_var("CADENCE_BURSTING") };
    }

    #[test]
    fn env_ignores_invalid_queue_size() {
        // SAFETY: each test touches its own variable.
        unsafe { std::env::set_var("CADENCE_QUEUE_SIZE", "lots") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.queue_size, 5_000);
        unsafe { std::env::remove_var("CADENCE_QUEUE_SIZE") };
    }
}

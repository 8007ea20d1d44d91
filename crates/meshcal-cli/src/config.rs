//! Configuration vault – reads/writes `~/.meshcal/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use meshcal_spatial::CanonicalFrame;
use meshcal_spatial::canonical::DEFAULT_FLOOR_HEIGHT_M;
use meshcal_types::CalibError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Persisted calibration settings.
///
/// The three plan fields together define the canonical frame; leave any of
/// them out and the engine runs without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_width_px: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_height_px: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixels_per_meter: Option<f32>,

    /// Reference floor height in tracking metres.
    #[serde(default = "default_floor_height")]
    pub floor_height_m: f32,

    /// Bake vertices into canonical estimates when a triangle completes.
    #[serde(default = "default_bake_on_complete")]
    pub bake_on_complete: bool,
}

fn default_floor_height() -> f32 {
    DEFAULT_FLOOR_HEIGHT_M
}
fn default_bake_on_complete() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            map_width_px: None,
            map_height_px: None,
            pixels_per_meter: None,
            floor_height_m: default_floor_height(),
            bake_on_complete: default_bake_on_complete(),
        }
    }
}

impl Config {
    /// The canonical frame, when the plan is fully described.
    pub fn frame(&self) -> Result<Option<CanonicalFrame>, CalibError> {
        match (self.map_width_px, self.map_height_px, self.pixels_per_meter) {
            (Some(w), Some(h), Some(ppm)) => {
                CanonicalFrame::from_map_size(w, h, ppm, self.floor_height_m).map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// Return the path to `~/.meshcal/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".meshcal").join("config.toml")
}

/// Load the config with `MESHCAL_*` overrides applied. Returns `None` when
/// the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    let mut cfg = load_from(&config_path())?;
    if let Some(c) = cfg.as_mut() {
        apply_env_overrides(c);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(toml::from_str(&raw)?))
}

/// Apply `MESHCAL_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MESHCAL_MAP_WIDTH_PX` | `map_width_px` |
/// | `MESHCAL_MAP_HEIGHT_PX` | `map_height_px` |
/// | `MESHCAL_PIXELS_PER_METER` | `pixels_per_meter` |
/// | `MESHCAL_FLOOR_HEIGHT_M` | `floor_height_m` |
/// | `MESHCAL_BAKE_ON_COMPLETE` | `bake_on_complete` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(v) = env_parse::<f32>("MESHCAL_MAP_WIDTH_PX") {
        cfg.map_width_px = Some(v);
    }
    if let Some(v) = env_parse::<f32>("MESHCAL_MAP_HEIGHT_PX") {
        cfg.map_height_px = Some(v);
    }
    if let Some(v) = env_parse::<f32>("MESHCAL_PIXELS_PER_METER") {
        cfg.pixels_per_meter = Some(v);
    }
    if let Some(v) = env_parse::<f32>("MESHCAL_FLOOR_HEIGHT_M") {
        cfg.floor_height_m = v;
    }
    if let Some(v) = env_parse::<bool>("MESHCAL_BAKE_ON_COMPLETE") {
        cfg.bake_on_complete = v;
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok()?.trim().parse().ok()
}

/// Save the config to `~/.meshcal/config.toml`.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config {
            map_width_px: Some(1200.0),
            map_height_px: Some(800.0),
            pixels_per_meter: Some(50.0),
            floor_height_m: -1.3,
            bake_on_complete: false,
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "pixels_per_meter = 40.0\n").expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.pixels_per_meter, Some(40.0));
        assert!((cfg.floor_height_m - DEFAULT_FLOOR_HEIGHT_M).abs() < 1e-6);
        assert!(cfg.bake_on_complete);
        // Width and height missing: no frame.
        assert_eq!(cfg.frame().expect("valid"), None);
    }

    #[test]
    fn full_plan_yields_frame() {
        let cfg = Config {
            map_width_px: Some(1000.0),
            map_height_px: Some(600.0),
            pixels_per_meter: Some(100.0),
            ..Config::default()
        };
        let frame = cfg.frame().expect("valid").expect("some");
        assert!((frame.origin.x - 500.0).abs() < 1e-6);
        assert!((frame.origin.y - 300.0).abs() < 1e-6);

        let bad = Config {
            pixels_per_meter: Some(0.0),
            ..cfg
        };
        assert!(bad.frame().is_err());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "pixels_per_meter = \"lots\"\n").expect("write");
        assert!(matches!(load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn config_path_points_to_meshcal_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".meshcal"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn env_override_sets_map_width() {
        // SAFETY: each override test owns a distinct variable.
        unsafe { std::env::set_var("MESHCAL_MAP_WIDTH_PX", "2048") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.map_width_px, Some(2048.0));
        unsafe { std::env::remove_var("MESHCAL_MAP_WIDTH_PX") };
    }

    #[test]
    fn env_override_ignores_invalid_scale() {
        // SAFETY: each override test owns a distinct variable.
        unsafe { std::env::set_var("MESHCAL_PIXELS_PER_METER", "not-a-number") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.pixels_per_meter, None);

        unsafe { std::env::set_var("MESHCAL_PIXELS_PER_METER", " 75.5 ") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.pixels_per_meter, Some(75.5));
        unsafe { std::env::remove_var("MESHCAL_PIXELS_PER_METER") };
    }

    #[test]
    fn env_override_disables_bake() {
        // SAFETY: each override test owns a distinct variable.
        unsafe { std::env::set_var("MESHCAL_BAKE_ON_COMPLETE", "false") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!(!cfg.bake_on_complete);
        unsafe { std::env::remove_var("MESHCAL_BAKE_ON_COMPLETE") };
    }
}

//! Configuration Vault – reads/writes `~/.capstan/config.toml`.
//!
//! ```toml
//! caller_id = "operator"
//! permission = "user"
//!
//! [engine]
//! validation_level = "standard"
//! audit_capacity = 1000
//! max_memory_percent = 90.0
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use capstan_runtime::EngineConfig;
use capstan_types::{PermissionLevel, ValidationLevel};
use serde::{Deserialize, Serialize};

/// Persisted CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Identity recorded on every call made from the shell.
    #[serde(default = "default_caller")]
    pub caller_id: String,

    /// Permission tier the shell starts with.
    #[serde(default = "default_permission")]
    pub permission: PermissionLevel,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_caller() -> String {
    "operator".to_string()
}
fn default_permission() -> PermissionLevel {
    PermissionLevel::User
}

impl Default for Config {
    fn default() -> Self {
        Self {
            caller_id: default_caller(),
            permission: default_permission(),
            engine: EngineConfig::default(),
        }
    }
}

/// Return the path to `~/.capstan/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".capstan").join("config.toml")
}

/// Load the config from disk and apply environment overrides.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `CAPSTAN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CAPSTAN_CALLER` | `caller_id` |
/// | `CAPSTAN_PERMISSION` | `permission` |
/// | `CAPSTAN_VALIDATION_LEVEL` | `engine.validation_level` |
/// | `CAPSTAN_AUDIT_CAPACITY` | `engine.audit_capacity` |
/// | `CAPSTAN_MAX_MEMORY_PERCENT` | `engine.max_memory_percent` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("CAPSTAN_CALLER")
        && !v.trim().is_empty()
    {
        cfg.caller_id = v;
    }
    if let Ok(v) = std::env::var("CAPSTAN_PERMISSION")
        && let Ok(tier) = v.parse::<PermissionLevel>()
    {
        cfg.permission = tier;
    }
    if let Ok(v) = std::env::var("CAPSTAN_VALIDATION_LEVEL")
        && let Ok(level) = v.parse::<ValidationLevel>()
    {
        cfg.engine.validation_level = level;
    }
    if let Ok(v) = std::env::var("CAPSTAN_AUDIT_CAPACITY")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.engine.audit_capacity = n;
    }
    if let Ok(v) = std::env::var("CAPSTAN_MAX_MEMORY_PERCENT")
        && let Ok(pct) = v.parse::<f64>()
        && (0.0..=100.0).contains(&pct)
    {
        cfg.engine.max_memory_percent = Some(pct);
    }
}

/// Save the config to disk, creating `~/.capstan/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_custom_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.permission = PermissionLevel::Admin;
        cfg.engine.validation_level = ValidationLevel::Strict;
        cfg.engine.max_memory_percent = Some(85.0);
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.permission, PermissionLevel::Admin);
        assert_eq!(loaded.engine.validation_level, ValidationLevel::Strict);
        assert_eq!(loaded.engine.max_memory_percent, Some(85.0));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "caller_id = \"ci\"\n").unwrap();
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.caller_id, "ci");
        assert_eq!(loaded.engine, EngineConfig::default());
    }

    #[test]
    fn garbage_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "permission = [not toml").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn config_path_points_to_capstan_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".capstan"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_permission() {
        // SAFETY: only this test touches CAPSTAN_PERMISSION.
        unsafe { std::env::set_var("CAPSTAN_PERMISSION", "admin") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.permission, PermissionLevel::Admin);
        unsafe { std::env::remove_var("CAPSTAN_PERMISSION") };
    }

    #[test]
    fn apply_env_overrides_changes_validation_level() {
        // SAFETY: only this test touches CAPSTAN_VALIDATION_LEVEL.
        unsafe { std::env::set_var("CAPSTAN_VALIDATION_LEVEL", "baseline") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.engine.validation_level, ValidationLevel::Basic);
        unsafe { std::env::remove_var("CAPSTAN_VALIDATION_LEVEL") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_capacity() {
        // SAFETY: only this test touches CAPSTAN_AUDIT_CAPACITY.
        unsafe { std::env::set_var("CAPSTAN_AUDIT_CAPACITY", "lots") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.engine.audit_capacity, EngineConfig::default().audit_capacity);
        unsafe { std::env::remove_var("CAPSTAN_AUDIT_CAPACITY") };
    }

    #[test]
    fn apply_env_overrides_rejects_out_of_range_memory_limit() {
        // SAFETY: only this test touches CAPSTAN_MAX_MEMORY_PERCENT.
        unsafe { std::env::set_var("CAPSTAN_MAX_MEMORY_PERCENT", "140") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.engine.max_memory_percent, None);
        unsafe { std::env::remove_var("CAPSTAN_MAX_MEMORY_PERCENT") };
    }
}

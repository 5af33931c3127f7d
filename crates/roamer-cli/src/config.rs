//! Configuration vault – reads/writes `~/.roamer/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use roamer_runtime::{ApiKey, AutonomySettings};
use serde::{Deserialize, Serialize};

/// Persisted user configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub autonomy: AutonomySettings,

    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Knobs for the in-process simulated robot used by `roamer simulate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_robot_id")]
    pub robot_id: String,

    /// Time each actuator call takes.
    #[serde(default = "default_actuator_delay_ms")]
    pub actuator_delay_ms: u64,
}

fn default_robot_id() -> String {
    "sim-01".to_string()
}
fn default_actuator_delay_ms() -> u64 {
    50
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            robot_id: default_robot_id(),
            actuator_delay_ms: default_actuator_delay_ms(),
        }
    }
}

/// Return the path to `~/.roamer/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".roamer").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// The stored config, or defaults; environment overrides apply either way.
pub fn load_or_default() -> Result<Config, String> {
    let mut cfg = load()?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `ROAMER_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROAMER_ENABLE` | `autonomy.enable` |
/// | `ROAMER_LLM_PROVIDER` | `autonomy.llm_provider` |
/// | `ROAMER_LLM_KEY` | `autonomy.llm_key` |
/// | `ROAMER_MODEL` | `autonomy.model` |
/// | `ROAMER_ENDPOINT` | `autonomy.endpoint` |
/// | `ROAMER_MAX_ITERATIONS` | `autonomy.max_loop_iterations` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    let autonomy = &mut cfg.autonomy;
    if let Some(v) = var("ROAMER_ENABLE")
        && let Some(enable) = parse_flag(&v)
    {
        autonomy.enable = enable;
    }
    if let Some(v) = var("ROAMER_LLM_PROVIDER") {
        autonomy.llm_provider = v;
    }
    if let Some(v) = var("ROAMER_LLM_KEY") {
        autonomy.llm_key = ApiKey::from(v);
    }
    if let Some(v) = var("ROAMER_MODEL") {
        autonomy.model = v;
    }
    if let Some(v) = var("ROAMER_ENDPOINT") {
        autonomy.endpoint = v;
    }
    if let Some(v) = var("ROAMER_MAX_ITERATIONS")
        && let Ok(n) = v.trim().parse::<u32>()
    {
        autonomy.max_loop_iterations = n;
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Save the config to disk, creating `~/.roamer/` if necessary.
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
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write: the file holds the LLM key.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

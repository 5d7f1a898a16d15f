use super::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_ENGINE_LIBRARY: &str = "libwebviewchromium.so";

pub const DEFAULT_INIT_SYMBOL: &str = "engine_start";

pub const DEFAULT_LOOPER_NAME: &str = "engine-main";

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct StartupConfig {
    /// Every section carries `#[serde(default)]`: a malformed or missing `[logging]`
    /// group must not throw away a valid `[engine]` group, and vice versa.
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Shared library holding the engine, resolved by the platform loader
    #[serde(default = "default_library")]
    pub library: String,
    /// `extern "C" fn() -> c_int` that starts the engine; zero means success
    #[serde(default = "default_init_symbol")]
    pub init_symbol: String,
    #[serde(default = "default_looper_name")]
    pub looper_name: String,
    /// Bind the engine to the main looper rather than the first caller's looper
    #[serde(default = "default_require_main_looper")]
    pub require_main_looper: bool,
}

fn default_library() -> String {
    DEFAULT_ENGINE_LIBRARY.to_string()
}

fn default_init_symbol() -> String {
    DEFAULT_INIT_SYMBOL.to_string()
}

fn default_looper_name() -> String {
    DEFAULT_LOOPER_NAME.to_string()
}

fn default_require_main_looper() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            library: default_library(),
            init_symbol: default_init_symbol(),
            looper_name: default_looper_name(),
            require_main_looper: default_require_main_looper(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `off`, `error`, `warn`, `info`, `debug` or `trace`. Unset picks by build profile.
    #[serde(default)]
    pub level: Option<String>,
    /// Only used on Android, where error records are forwarded as Sentry events
    #[serde(default)]
    pub sentry_dsn: Option<String>,
}

/// Read the config at `path`.
///
/// A missing file is created with the defaults. A malformed file is replaced by the
/// defaults (the broken one is kept as `.bak`) so the user can fix it again.
pub fn parse_config(path: &Path) -> StartupConfig {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            log::info!("No config at {} ({}), using defaults", path.display(), err);
            let default_config = StartupConfig::default();
            if let Err(err) = save_config(&default_config, path) {
                log::warn!("Failed to write default config: {}", err);
            }
            return default_config;
        }
    };

    match toml::from_str::<StartupConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            log::warn!("Config {} is malformed: {}", path.display(), err);
            let default_config = StartupConfig::default();
            if let Err(err) = save_config(&default_config, path) {
                log::warn!("Failed to reset malformed config: {}", err);
            }
            default_config
        }
    }
}

pub fn save_config(config: &StartupConfig, path: &Path) -> Result<(), ConfigError> {
    // If the file already exists, rename it to .bak
    if path.exists() {
        let backup_path = path.with_extension("bak");
        if let Err(err) = fs::rename(path, &backup_path) {
            log::warn!("Failed to create backup of existing config: {}", err);
        }
    }

    if let Some(config_dir) = path.parent() {
        fs::create_dir_all(config_dir)?;
    }

    let config_str = toml::to_string(config)?;
    fs::write(path, config_str)?;
    Ok(())
}

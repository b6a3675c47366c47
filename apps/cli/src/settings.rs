use anyhow::Context;
use config::{Config, Environment, File, Map};
use lumen_logger::{FileFormat, LevelFilter, Logger};
use lumen_storage::StorageConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "lumen.toml";
const ENV_PREFIX: &str = "LUMEN";

/// Everything the `lumen` binary reads from its configuration sources.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageConfig,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `error`, `warn`, `info`, `debug`, `trace` or `off`.
    pub level: String,
    /// Module directives such as `lumen_storage=debug`. Overrides `level`.
    pub filter: Option<String>,
    /// Directory for rolling log files. Console-only when unset.
    pub directory: Option<PathBuf>,
    /// `text` or `json`, for the file sink.
    pub format: String,
    pub max_files: usize,
    pub ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_owned(),
            filter: None,
            directory: None,
            format: "json".to_owned(),
            max_files: 5,
            ansi: true,
        }
    }
}

impl LogSettings {
    /// Installs the global subscriber. `verbose` forces debug output.
    ///
    /// # Errors
    /// Unparseable level or format, or any [`lumen_logger::LoggerError`].
    pub fn install(&self, name: &str, verbose: bool) -> anyhow::Result<Logger> {
        let level = if verbose {
            LevelFilter::DEBUG
        } else {
            self.level.parse().with_context(|| format!("Invalid log level {:?}", self.level))?
        };

        let mut builder = Logger::builder().name(name).level(level).ansi(self.ansi);
        if let Some(filter) = self.filter.as_ref().filter(|_| !verbose) {
            builder = builder.env_filter(filter.clone());
        }

        let logger = match &self.directory {
            Some(directory) => {
                let format: FileFormat = self
                    .format
                    .parse()
                    .with_context(|| format!("Invalid log format {:?}", self.format))?;
                builder.path(directory).format(format).max_files(self.max_files).init()?
            },
            None => builder.init()?,
        };
        Ok(logger)
    }
}

/// Loads settings from `path` (required) or `lumen.toml` (optional), then applies `LUMEN__`
/// environment overrides such as `LUMEN__STORAGE__MEMORY__MAX_BYTES`.
///
/// # Errors
/// A missing explicit file, malformed TOML, or values of the wrong type.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    load_settings_with_env(path, None)
}

/// Like [`load_settings`], reading overrides from `env` instead of the process environment.
///
/// # Errors
/// See [`load_settings`].
pub fn load_settings_with_env(
    path: Option<&Path>,
    env: Option<Map<String, String>>,
) -> anyhow::Result<Settings> {
    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::from(Path::new(DEFAULT_CONFIG_FILE)).required(false),
    };

    let overrides =
        Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true).source(env);

    let settings = Config::builder()
        .add_source(file)
        .add_source(overrides)
        .build()
        .context("Failed to build config")?
        .try_deserialize::<Settings>()
        .context("Failed to deserialize config")?;

    Ok(settings)
}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name looked up in the current directory.
pub const LOCAL_CONFIG_FILE: &str = ".pdf-to-text.toml";

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub conversion: Option<ConversionConfig>,
    pub ignore: Option<IgnoreConfig>,
    pub concurrency: Option<ConcurrencyConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionConfig {
    pub preserve_structure: Option<bool>,
    pub compress: Option<bool>,
    pub extract_metadata: Option<bool>,
    pub shell_command: Option<String>,
    pub hash_check: Option<bool>,
    pub hash_store: Option<String>,
    pub expand_ligatures: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IgnoreConfig {
    pub patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub workers: Option<usize>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_file: Option<String>,
}

/// A config file that exists but could not be used. Loading carries on
/// without it; the caller decides where to report it.
#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("ignoring unparsable config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Platform config directory path: `<config_dir>/pdf-to-text/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pdf-to-text").join("config.toml"))
}

/// Load config by cascading CWD `.pdf-to-text.toml` over platform config.
/// CWD values override platform values. Files that fail to load are skipped
/// and returned alongside the result, since logging is not set up yet.
pub fn load_config() -> (ConfigFile, Vec<ConfigFileError>) {
    let mut errors = Vec::new();
    let mut load = |path: &Path| {
        load_from_path(path).unwrap_or_else(|e| {
            errors.push(e);
            None
        })
    };
    let platform = config_path().and_then(|p| load(&p));
    let cwd = load(Path::new(LOCAL_CONFIG_FILE));

    let config = match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    };
    (config, errors)
}

/// Load a config from a specific path. A missing file is `Ok(None)`.
pub fn load_from_path(path: &Path) -> Result<Option<ConfigFile>, ConfigFileError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigFileError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&content)
        .map(Some)
        .map_err(|source| ConfigFileError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let conv = |c: &ConfigFile| c.conversion.clone().unwrap_or_default();
    let (b, o) = (conv(&base), conv(&overlay));
    let conversion = ConversionConfig {
        preserve_structure: o.preserve_structure.or(b.preserve_structure),
        compress: o.compress.or(b.compress),
        extract_metadata: o.extract_metadata.or(b.extract_metadata),
        shell_command: o.shell_command.or(b.shell_command),
        hash_check: o.hash_check.or(b.hash_check),
        hash_store: o.hash_store.or(b.hash_store),
        expand_ligatures: o.expand_ligatures.or(b.expand_ligatures),
    };

    // Ignore lists replace rather than concatenate
    let ignore = IgnoreConfig {
        patterns: overlay
            .ignore
            .as_ref()
            .and_then(|i| i.patterns.clone())
            .or_else(|| base.ignore.as_ref().and_then(|i| i.patterns.clone())),
    };

    let concurrency = ConcurrencyConfig {
        workers: overlay
            .concurrency
            .as_ref()
            .and_then(|c| c.workers)
            .or_else(|| base.concurrency.as_ref().and_then(|c| c.workers)),
        timeout_secs: overlay
            .concurrency
            .as_ref()
            .and_then(|c| c.timeout_secs)
            .or_else(|| base.concurrency.as_ref().and_then(|c| c.timeout_secs)),
    };

    let logging = LoggingConfig {
        log_file: overlay
            .logging
            .as_ref()
            .and_then(|l| l.log_file.clone())
            .or_else(|| base.logging.as_ref().and_then(|l| l.log_file.clone())),
    };

    ConfigFile {
        conversion: Some(conversion),
        ignore: Some(ignore),
        concurrency: Some(concurrency),
        logging: Some(logging),
    }
}

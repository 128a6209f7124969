//! `peerdrop.toml`: core session and transfer options plus CLI logging.

use anyhow::Context;
use peerdrop_core::{PeerConfig, TransferConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub peer: PeerConfig,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when neither `RUST_LOG` nor `-v` is given
    pub level: LogLevel,
}

/// Default tracing filter level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl Config {
    /// `$XDG_CONFIG_HOME/peerdrop/config.toml` or the platform equivalent
    #[must_use]
    pub fn default_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
        base.join("peerdrop").join("config.toml")
    }

    /// Parse the file at `path`.
    ///
    /// # Errors
    ///
    /// Unreadable file or invalid TOML.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// An existing file that cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.try_exists()? {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Serialization or filesystem failure.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    #[must_use]
    pub fn core(&self) -> peerdrop_core::Config {
        peerdrop_core::Config {
            peer: self.peer.clone(),
            transfer: self.transfer.clone(),
        }
    }

    /// # Errors
    ///
    /// Any option combination the core library refuses.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.core().validate().context("invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.core(), peerdrop_core::Config::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_core_rejections_surface() {
        let mut config = Config::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sparse_file() {
        let config: Config = toml::from_str(
            "[peer]\nencryption = false\n\n[transfer]\nchunk_size = 4096\n\n[logging]\nlevel = \"warn\"\n",
        )
        .unwrap();
        assert!(!config.peer.encryption);
        assert_eq!(config.transfer.chunk_size, 4096);
        assert_eq!(config.peer.connection_timeout_ms, 20_000);
        assert_eq!(config.logging.level.as_str(), "warn");
    }

    #[test]
    fn test_unknown_level_is_a_parse_error() {
        assert!(toml::from_str::<Config>("[logging]\nlevel = \"loud\"\n").is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/config.toml");

        let mut config = Config::default();
        config.transfer.max_concurrent_transfers = 5;
        config.logging.level = LogLevel::Trace;
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
        assert_eq!(
            Config::load_or_default(&dir.path().join("absent.toml")).unwrap(),
            Config::default()
        );
    }
}

//! Index configuration.
//!
//! Loaded from a TOML file. Every field has a default, so an empty file (or
//! no file at all) yields a working configuration:
//!
//! ```toml
//! db_path = "~/.local/share/trove/index.db"
//! deletion_grace_ms = 2000
//! checker_workers = 2
//! roots = ["~/Music"]
//!
//! [[schema.audio]]
//! name = "composer"
//! class = "indexed"
//! kind = "text"
//! case_sensitive = false
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trove_types::AttrSpec;

use crate::error::{IndexError, IndexResult};

/// Default grace window before a path missing from a listing is deleted.
pub const DEFAULT_DELETION_GRACE_MS: u64 = 2000;

/// Index configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// SQLite database file. `:memory:` keeps the store in memory.
    pub db_path: PathBuf,
    /// Unix socket the server listens on.
    pub socket_path: PathBuf,
    /// How long a path may be missing from its directory listing before the
    /// object is removed. `0` removes on the first missing listing.
    pub deletion_grace_ms: u64,
    /// Concurrent re-parses per checker task.
    pub checker_workers: usize,
    /// Re-validation rounds per scan cycle before settling.
    pub max_rechecks: u32,
    /// Per-connection notification buffer before progress is coalesced.
    pub event_queue_depth: usize,
    /// Local directories attached as mountpoints at startup.
    pub roots: Vec<PathBuf>,
    /// Per-type attribute declarations merged over the built-in schema.
    pub schema: BTreeMap<String, Vec<AttrSpec>>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            socket_path: default_socket_path(),
            deletion_grace_ms: DEFAULT_DELETION_GRACE_MS,
            checker_workers: 1,
            max_rechecks: 4,
            event_queue_depth: 256,
            roots: Vec::new(),
            schema: BTreeMap::new(),
        }
    }
}

impl IndexConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> IndexResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IndexError::config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> IndexResult<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => Ok(Self::default()),
        }
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> IndexResult<Self> {
        let mut config: Self =
            toml::from_str(text).map_err(|e| IndexError::config(e.to_string()))?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    pub fn deletion_grace(&self) -> Duration {
        Duration::from_millis(self.deletion_grace_ms)
    }

    fn expand_paths(&mut self) {
        self.db_path = expand(&self.db_path);
        self.socket_path = expand(&self.socket_path);
        for root in &mut self.roots {
            *root = expand(root);
        }
    }

    fn validate(&self) -> IndexResult<()> {
        if self.checker_workers == 0 {
            return Err(IndexError::config("checker_workers must be at least 1"));
        }
        if self.event_queue_depth == 0 {
            return Err(IndexError::config("event_queue_depth must be at least 1"));
        }
        Ok(())
    }
}

fn expand(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&s).into_owned())
}

/// `$XDG_DATA_HOME/trove/index.db`.
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trove")
        .join("index.db")
}

/// `$XDG_RUNTIME_DIR/trove/trove.sock`, falling back to the data dir.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trove")
        .join("trove.sock")
}

/// `$XDG_CONFIG_HOME/trove/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("trove").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_types::{AttrClass, ValueKind};

    #[test]
    fn empty_file_gives_defaults() {
        let config = IndexConfig::from_toml("").unwrap();
        assert_eq!(config.deletion_grace_ms, DEFAULT_DELETION_GRACE_MS);
        assert_eq!(config.checker_workers, 1);
        assert_eq!(config.max_rechecks, 4);
        assert!(config.db_path.ends_with("trove/index.db"));
    }

    #[test]
    fn schema_overrides_parse() {
        let config = IndexConfig::from_toml(
            r#"
            deletion_grace_ms = 0

            [[schema.audio]]
            name = "composer"
            class = "indexed"
            kind = "text"
            case_sensitive = false
            "#,
        )
        .unwrap();
        assert_eq!(config.deletion_grace(), Duration::ZERO);
        let audio = &config.schema["audio"];
        assert_eq!(audio[0].name, "composer");
        assert_eq!(audio[0].class, AttrClass::Indexed);
        assert_eq!(audio[0].kind, ValueKind::Text);
        assert!(!audio[0].case_sensitive);
    }

    #[test]
    fn tilde_is_expanded() {
        let config = IndexConfig::from_toml(r#"roots = ["~/Music"]"#).unwrap();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.roots[0], home.join("Music"));
        }
    }

    #[test]
    fn zero_workers_rejected() {
        let err = IndexConfig::from_toml("checker_workers = 0").unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));
    }

    #[test]
    fn missing_file_falls_back() {
        let config =
            IndexConfig::load_or_default(Some(Path::new("/nonexistent/trove.toml"))).unwrap();
        assert_eq!(config, IndexConfig::default());
    }
}

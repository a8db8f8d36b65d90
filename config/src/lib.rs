//! Layered configuration for TUIDE.
//!
//! Up to three TOML files are merged, lowest precedence first: system,
//! user, project. A built-in layer below them supplies default language
//! servers. Tables merge key by key; any other value replaces.

mod lsp;
mod placeholder;

use std::fs;
use std::path::{Path, PathBuf};

pub use lsp::ServerEntry;
pub use placeholder::MAX_PLACEHOLDER_PASSES;

/// Built-in lowest layer.
const DEFAULTS: &str = r#"
[lsp.servers.python]
command = ["pylsp"]
extensions = ["py", "pyi"]

[lsp.servers.rust]
command = ["rust-analyzer"]
extensions = ["rs"]
"#;

const PROJECT_FILE: &str = ".tuide.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A section exists but does not have the expected shape.
    #[error("invalid `{key}`: {message}")]
    Invalid { key: String, message: String },

    #[error("no language server configured for `{0}`")]
    MissingServer(String),

    #[error("language server command for `{0}` is empty")]
    EmptyCommand(String),
}

impl ConfigError {
    /// The file this error came from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Locations of the three file layers. `None` skips a layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    pub system: Option<PathBuf>,
    pub user: Option<PathBuf>,
    pub project: Option<PathBuf>,
}

impl ConfigPaths {
    /// `/etc/tuide/config.toml`, `<config dir>/tuide/config.toml` and
    /// `<root>/.tuide.toml`.
    #[must_use]
    pub fn standard(root: &Path) -> Self {
        Self {
            system: cfg!(unix).then(|| PathBuf::from("/etc/tuide/config.toml")),
            user: dirs::config_dir().map(|dir| dir.join("tuide").join("config.toml")),
            project: Some(root.join(PROJECT_FILE)),
        }
    }

    fn layers(&self) -> impl Iterator<Item = &Path> {
        [&self.system, &self.user, &self.project]
            .into_iter()
            .filter_map(|p| p.as_deref())
    }
}

/// Merged settings for one workspace.
#[derive(Debug, Clone)]
pub struct Settings {
    root: PathBuf,
    merged: toml::Table,
}

impl Settings {
    /// Load the standard layers for `root`.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        Self::load_from(root, &ConfigPaths::standard(root))
    }

    /// Load the given layers on top of the built-in defaults. Missing files
    /// are skipped.
    pub fn load_from(root: &Path, paths: &ConfigPaths) -> Result<Self, ConfigError> {
        let mut merged = defaults();
        for path in paths.layers() {
            if let Some(layer) = read_layer(path)? {
                tracing::debug!("Loaded config layer {}", path.display());
                merge_tables(&mut merged, layer);
            }
        }
        Ok(Self::from_table(root, merged))
    }

    /// Settings from an already-merged table.
    #[must_use]
    pub fn from_table(root: &Path, merged: toml::Table) -> Self {
        Self {
            root: std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf()),
            merged,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Raw merged value at a dotted path (`"lsp.timeouts.request_ms"`).
    #[must_use]
    pub fn get(&self, dotted: &str) -> Option<&toml::Value> {
        let mut parts = dotted.split('.');
        let mut current = self.merged.get(parts.next()?)?;
        for part in parts {
            current = current.as_table()?.get(part)?;
        }
        Some(current)
    }

    /// Scalar at a dotted path as text, with placeholders resolved.
    #[must_use]
    pub fn get_str(&self, dotted: &str) -> Option<String> {
        let raw = scalar_text(self.get(dotted)?)?;
        Some(self.resolve(&raw))
    }

    /// Expand `%workspace_root%` and `%config:a.b%` placeholders in `text`.
    #[must_use]
    pub fn resolve(&self, text: &str) -> String {
        placeholder::resolve(text, |token| self.expand_token(token))
    }

    fn expand_token(&self, token: &str) -> Option<String> {
        if token == "workspace_root" {
            return Some(self.root.display().to_string());
        }
        let key = token.strip_prefix("config:")?;
        self.get(key).and_then(scalar_text)
    }
}

fn defaults() -> toml::Table {
    // Parse failures are caught by `test_defaults_parse`.
    toml::from_str(DEFAULTS).unwrap_or_default()
}

fn read_layer(path: &Path) -> Result<Option<toml::Table>, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    toml::from_str(&content).map(Some).map_err(|source| {
        tracing::warn!("Failed to parse config at {}: {source}", path.display());
        ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Deep-merge `source` into `target`.
fn merge_tables(target: &mut toml::Table, source: toml::Table) {
    for (key, value) in source {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = target.get_mut(&key) {
                merge_tables(existing, incoming);
            } else {
                target.insert(key, toml::Value::Table(incoming));
            }
        } else {
            target.insert(key, value);
        }
    }
}

fn scalar_text(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(dt) => Some(dt.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

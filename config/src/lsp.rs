//! `[lsp]` section: language servers and client timeouts.
//!
//! ```toml
//! [lsp.servers.python]
//! command = ["pylsp", "--log-file", "%workspace_root%/.tuide/pylsp.log"]
//! extensions = ["py"]
//!
//! [lsp.timeouts]
//! request_ms = 5000
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tuide_lsp::{ClientConfig, Timeouts};

use crate::{ConfigError, Settings};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    /// Whitespace-separated command line.
    Line(String),
    Argv(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    command: CommandSpec,
    #[serde(default)]
    extensions: Vec<String>,
}

/// One configured language server, command placeholders resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub language: String,
    pub command: Vec<String>,
    /// Extensions without the leading dot.
    pub extensions: Vec<String>,
}

impl ServerEntry {
    fn handles(&self, extension: &str) -> bool {
        self.extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(extension))
    }
}

impl Settings {
    /// All configured servers, ordered by language name.
    pub fn servers(&self) -> Result<Vec<ServerEntry>, ConfigError> {
        let Some(raw) = self.get("lsp.servers") else {
            return Ok(Vec::new());
        };
        let sections: BTreeMap<String, ServerSection> =
            raw.clone()
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::Invalid {
                    key: "lsp.servers".to_string(),
                    message: e.to_string(),
                })?;

        Ok(sections
            .into_iter()
            .map(|(language, section)| self.server_entry(language, section))
            .collect())
    }

    fn server_entry(&self, language: String, section: ServerSection) -> ServerEntry {
        let parts = match section.command {
            CommandSpec::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            CommandSpec::Argv(argv) => argv,
        };
        ServerEntry {
            language,
            command: parts.iter().map(|part| self.resolve(part)).collect(),
            extensions: section
                .extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect(),
        }
    }

    /// The server for `language`.
    pub fn server(&self, language: &str) -> Result<ServerEntry, ConfigError> {
        self.servers()?
            .into_iter()
            .find(|s| s.language == language)
            .ok_or_else(|| ConfigError::MissingServer(language.to_string()))
    }

    /// The server whose extensions cover `path`. When several do, the
    /// alphabetically first language wins.
    pub fn server_for_path(&self, path: &Path) -> Result<Option<ServerEntry>, ConfigError> {
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            return Ok(None);
        };
        let mut matching = self
            .servers()?
            .into_iter()
            .filter(|s| s.handles(extension));
        let chosen = matching.next();
        if let (Some(chosen), Some(other)) = (&chosen, matching.next()) {
            tracing::warn!(
                "Multiple LSP servers configured for extension '{extension}': '{}' and '{}'. Using '{}'.",
                chosen.language,
                other.language,
                chosen.language
            );
        }
        Ok(chosen)
    }

    /// `[lsp.timeouts]`, defaulting any field not set.
    pub fn lsp_timeouts(&self) -> Result<Timeouts, ConfigError> {
        let Some(raw) = self.get("lsp.timeouts") else {
            return Ok(Timeouts::default());
        };
        raw.clone()
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Invalid {
                key: "lsp.timeouts".to_string(),
                message: e.to_string(),
            })
    }

    /// Client configuration for `language`, rooted at the workspace root.
    pub fn client_config(&self, language: &str) -> Result<ClientConfig, ConfigError> {
        let server = self.server(language)?;
        if server.command.is_empty() {
            return Err(ConfigError::EmptyCommand(language.to_string()));
        }
        Ok(
            ClientConfig::new(language, server.command, self.root())
                .with_timeouts(self.lsp_timeouts()?),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn settings(toml_str: &str) -> Settings {
        Settings::from_table(Path::new("/ws"), toml::from_str(toml_str).unwrap())
    }

    #[test]
    fn test_servers_sorted_and_commands_normalized() {
        let settings = settings(
            r#"
[lsp.servers.rust]
command = "rust-analyzer --stdio"
extensions = [".rs"]

[lsp.servers.python]
command = ["pylsp", "--log-file", "%workspace_root%/pylsp.log"]
extensions = ["py"]
"#,
        );

        let servers = settings.servers().unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].language, "python");
        assert_eq!(
            servers[0].command,
            vec![
                "pylsp".to_string(),
                "--log-file".to_string(),
                format!("{}/pylsp.log", settings.root().display()),
            ]
        );
        assert_eq!(servers[1].command, vec!["rust-analyzer", "--stdio"]);
        assert_eq!(servers[1].extensions, vec!["rs"]);
    }

    #[test]
    fn test_server_for_path_ties_pick_alphabetical_first() {
        let settings = settings(
            r#"
[lsp.servers.zeta]
command = "zls"
extensions = ["py"]

[lsp.servers.alpha]
command = "als"
extensions = ["PY"]
"#,
        );

        let chosen = settings
            .server_for_path(Path::new("/ws/main.py"))
            .unwrap()
            .unwrap();
        assert_eq!(chosen.language, "alpha");
        assert!(settings.server_for_path(Path::new("/ws/README")).unwrap().is_none());
        assert!(settings.server_for_path(Path::new("/ws/a.txt")).unwrap().is_none());
    }

    #[test]
    fn test_client_config_uses_timeouts_and_root() {
        let settings = settings(
            r#"
[lsp.servers.python]
command = "pylsp"
extensions = ["py"]

[lsp.timeouts]
request_ms = 750
"#,
        );

        let config = settings.client_config("python").unwrap();
        assert_eq!(config.language_id, "python");
        assert_eq!(config.command, vec!["pylsp"]);
        assert_eq!(config.root, PathBuf::from(settings.root()));
        assert_eq!(config.timeouts.request_ms, 750);
        assert_eq!(
            config.timeouts.initialize_ms,
            Timeouts::default().initialize_ms
        );
    }

    #[test]
    fn test_client_config_errors() {
        let settings = settings(
            r#"
[lsp.servers.blank]
command = "   "
"#,
        );
        assert!(matches!(
            settings.client_config("blank"),
            Err(ConfigError::EmptyCommand(lang)) if lang == "blank"
        ));
        assert!(matches!(
            settings.client_config("go"),
            Err(ConfigError::MissingServer(lang)) if lang == "go"
        ));
    }

    #[test]
    fn test_malformed_sections_are_invalid() {
        let settings = settings(
            r#"
[lsp.servers.python]
command = 5

[lsp.timeouts]
request_ms = "soon"
"#,
        );
        assert!(matches!(
            settings.servers(),
            Err(ConfigError::Invalid { ref key, .. }) if key == "lsp.servers"
        ));
        assert!(matches!(
            settings.lsp_timeouts(),
            Err(ConfigError::Invalid { ref key, .. }) if key == "lsp.timeouts"
        ));
    }

    #[test]
    fn test_no_lsp_section_means_no_servers() {
        let settings = settings("[colors]\nbackground = \"#000\"\n");
        assert!(settings.servers().unwrap().is_empty());
        assert_eq!(settings.lsp_timeouts().unwrap(), Timeouts::default());
    }
}

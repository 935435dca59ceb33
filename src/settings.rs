use anyhow::Context as _;
use lsp_types::{DocumentFilter, Url};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Configuration files the worker reloads rules from. Changes to these are
/// forwarded by the file watcher, never by the bridge itself.
pub const CONFIG_FILE_GLOB: &str =
    "**/{.stylelintrc{,.js,.json,.yaml,.yml},stylelint.config.js,.stylelintignore}";

const CONFIG_FILE_NAMES: [&str; 7] = [
    ".stylelintrc",
    ".stylelintrc.js",
    ".stylelintrc.json",
    ".stylelintrc.yaml",
    ".stylelintrc.yml",
    "stylelint.config.js",
    ".stylelintignore",
];

/// Whether `path` is one of the files matched by [`CONFIG_FILE_GLOB`].
pub fn is_config_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| CONFIG_FILE_NAMES.contains(&name))
}

/// The `stylelint` configuration section.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enable: bool,
    pub languages: Vec<String>,
    pub server: ServerSettings,
    pub request_timeout_ms: u64,
    pub autofix_command: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enable: true,
            languages: vec!["css".to_string()],
            server: ServerSettings::default(),
            request_timeout_ms: 10_000,
            autofix_command: crate::APPLY_AUTOFIX.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSettings {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            command: "stylelint-language-server".to_string(),
            args: vec!["--stdio".to_string()],
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let value = serde_json::from_str(&text)
            .with_context(|| format!("{} is not valid json", path.display()))?;
        Self::from_value(value)
    }

    /// Accepts either the bare section or an object holding it under
    /// `"stylelint"`, as editors send it in `workspace/didChangeConfiguration`.
    pub fn from_value(value: serde_json::Value) -> anyhow::Result<Self> {
        let section = match value {
            serde_json::Value::Object(mut map) if map.contains_key("stylelint") => {
                map.remove("stylelint").unwrap_or_default()
            }
            other => other,
        };
        serde_json::from_value(section).context("invalid stylelint settings")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn document_selector(&self) -> Vec<DocumentFilter> {
        self.languages
            .iter()
            .flat_map(|language| {
                ["file", "untitled"].map(|scheme| DocumentFilter {
                    language: Some(language.clone()),
                    scheme: Some(scheme.to_string()),
                    pattern: None,
                })
            })
            .collect()
    }

    /// Whether a document with this uri and language gets fixes.
    pub fn selects(&self, uri: &Url, language_id: &str) -> bool {
        self.document_selector().iter().any(|filter| {
            filter.language.as_deref() == Some(language_id)
                && filter.scheme.as_deref() == Some(uri.scheme())
        })
    }
}

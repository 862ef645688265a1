//! Public settings the print service exposes at `/print/config`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::{ApiClient, ApiError};

pub const CONFIG_PATH: &str = "/print/config";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub files_to_keep: u32,
    pub allowed_file_types: Vec<AllowedFileType>,
    pub print_job: PrintJobConfig,
    #[serde(default)]
    pub owners: Vec<Owner>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedFileType {
    pub extension: String,
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintJobConfig {
    pub timeout_ms: u64,
    /// Either milliseconds or a duration object such as `{"hours": 1}`.
    pub remove_after: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl ServiceConfig {
    pub fn owner_ids(&self) -> Vec<&str> {
        self.owners.iter().map(|o| o.id.as_str()).collect()
    }

    /// The declared file type for an extension, with or without the dot.
    pub fn file_type(&self, extension: &str) -> Option<&AllowedFileType> {
        let extension = extension.trim_start_matches('.');
        self.allowed_file_types
            .iter()
            .find(|t| t.extension.trim_start_matches('.').eq_ignore_ascii_case(extension))
    }

    /// Whether the service accepts uploads with this file extension.
    pub fn accepts_extension(&self, extension: &str) -> bool {
        self.file_type(extension).is_some()
    }
}

impl ApiClient {
    pub async fn service_config_raw(&self) -> Result<Value, ApiError> {
        self.get_json(CONFIG_PATH).await
    }

    pub async fn service_config(&self) -> Result<ServiceConfig, ApiError> {
        Ok(serde_json::from_value(self.service_config_raw().await?)?)
    }
}

// ---------------------------------------------------------------------------
// Tree rendering
// ---------------------------------------------------------------------------

/// Human titles for known config keys, by dotted path.
const DESCRIPTIONS: &[(&str, &str)] = &[
    ("filesToKeep", "Files kept per template type"),
    ("allowedFileTypes", "Allowed template file types"),
    ("printJob", "Print jobs"),
    ("printJob.timeoutMs", "Render timeout, ms"),
    ("printJob.removeAfter", "Output removed after"),
    ("owners", "Template owners"),
];

fn title_for(path: &str) -> Option<&'static str> {
    DESCRIPTIONS
        .iter()
        .find(|(p, _)| *p == path)
        .map(|(_, title)| *title)
}

/// One rendered node: objects nest, everything else is a leaf line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigNode {
    Section {
        path: String,
        title: String,
        children: Vec<ConfigNode>,
    },
    Leaf {
        path: String,
        title: String,
        key: String,
        value: String,
    },
}

/// Build a titled tree from the raw config JSON.
pub fn config_tree(value: &Value) -> Vec<ConfigNode> {
    match value {
        Value::Object(map) => convert(map, None),
        other => vec![ConfigNode::Leaf {
            path: String::new(),
            title: "value".to_string(),
            key: String::new(),
            value: other.to_string(),
        }],
    }
}

fn convert(map: &Map<String, Value>, prefix: Option<&str>) -> Vec<ConfigNode> {
    map.iter()
        .map(|(key, value)| {
            let path = match prefix {
                Some(prefix) => format!("{prefix}.{key}"),
                None => key.clone(),
            };
            let title = title_for(&path)
                .map(str::to_string)
                .unwrap_or_else(|| key.clone());
            match value {
                Value::Object(children) => ConfigNode::Section {
                    children: convert(children, Some(&path)),
                    path,
                    title,
                },
                Value::Array(_) => ConfigNode::Leaf {
                    value: serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
                    path,
                    title,
                    key: key.clone(),
                },
                Value::String(s) => ConfigNode::Leaf {
                    value: s.clone(),
                    path,
                    title,
                    key: key.clone(),
                },
                other => ConfigNode::Leaf {
                    value: other.to_string(),
                    path,
                    title,
                    key: key.clone(),
                },
            }
        })
        .collect()
}

/// Render the tree with two-space indentation per level.
pub fn render_tree(nodes: &[ConfigNode]) -> String {
    let mut out = String::new();
    render_into(nodes, 0, &mut out);
    out
}

fn render_into(nodes: &[ConfigNode], depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for node in nodes {
        match node {
            ConfigNode::Section {
                title, children, ..
            } => {
                out.push_str(&format!("{indent}{title}\n"));
                render_into(children, depth + 1, out);
            }
            ConfigNode::Leaf {
                title, key, value, ..
            } => {
                if value.contains('\n') {
                    out.push_str(&format!("{indent}{title} ({key}):\n"));
                    for line in value.lines() {
                        out.push_str(&format!("{indent}  {line}\n"));
                    }
                } else {
                    out.push_str(&format!("{indent}{title} ({key}): {value}\n"));
                }
            }
        }
    }
}

//! # Protocol Templates
//!
//! Response frames sent to the carrier are built from JSON templates, one per
//! response name. Templates are loaded once at startup, either from the
//! built-in set under `messages/` or from `protocol.templates_dir`, and are
//! never mutated afterwards: every response starts from a fresh clone.

use crate::error::{GatewayError, GatewayResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Response names the gateway cannot run without.
pub const REQUIRED_TEMPLATES: [&str; 4] = ["opened", "pong", "closed", "disconnect"];

const BUILTIN: [(&str, &str); 4] = [
    ("opened", include_str!("../../messages/opened.json")),
    ("pong", include_str!("../../messages/pong.json")),
    ("closed", include_str!("../../messages/closed.json")),
    ("disconnect", include_str!("../../messages/disconnect.json")),
];

/// Immutable set of response templates keyed by name.
#[derive(Debug, Clone)]
pub struct ProtocolTemplates {
    templates: BTreeMap<String, Value>,
}

impl ProtocolTemplates {
    /// The template set compiled into the binary.
    pub fn builtin() -> GatewayResult<Self> {
        let mut templates = BTreeMap::new();
        for (name, source) in BUILTIN {
            let value = serde_json::from_str(source)
                .map_err(|e| GatewayError::Config(format!("built-in template '{}': {}", name, e)))?;
            templates.insert(name.to_string(), value);
        }
        Self::from_map(templates)
    }

    /// Load every `*.json` file in `dir`, keyed by file stem.
    pub fn from_dir(dir: impl AsRef<Path>) -> GatewayResult<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| GatewayError::Config(format!("cannot read templates dir {}: {}", dir.display(), e)))?;

        let mut templates = BTreeMap::new();
        for entry in entries {
            let path = entry.map_err(|e| GatewayError::Config(e.to_string()))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let source = std::fs::read_to_string(&path)
                .map_err(|e| GatewayError::Config(format!("{}: {}", path.display(), e)))?;
            let value = serde_json::from_str(&source)
                .map_err(|e| GatewayError::Config(format!("{}: {}", path.display(), e)))?;
            templates.insert(name.to_string(), value);
        }

        info!(dir = %dir.display(), count = templates.len(), "Loaded response templates");
        Self::from_map(templates)
    }

    /// Built-in set when `dir` is empty, otherwise the directory.
    pub fn load(dir: &str) -> GatewayResult<Self> {
        if dir.trim().is_empty() {
            Self::builtin()
        } else {
            Self::from_dir(dir)
        }
    }

    fn from_map(templates: BTreeMap<String, Value>) -> GatewayResult<Self> {
        for (name, template) in &templates {
            if !template.is_object() {
                return Err(GatewayError::Config(format!("template '{}' is not a JSON object", name)));
            }
        }

        let set = Self { templates };
        for name in REQUIRED_TEMPLATES {
            if !set.templates.contains_key(name) {
                return Err(GatewayError::UnknownTemplate {
                    name: name.to_string(),
                    available: set.names(),
                });
            }
        }
        Ok(set)
    }

    /// A fresh copy of the named template.
    pub fn instantiate(&self, name: &str) -> GatewayResult<Value> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownTemplate {
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_set_is_complete() {
        let templates = ProtocolTemplates::builtin().unwrap();
        assert_eq!(templates.names(), vec!["closed", "disconnect", "opened", "pong"]);
        assert_eq!(templates.instantiate("pong").unwrap()["type"], "pong");
        assert_eq!(
            templates.instantiate("disconnect").unwrap()["parameters"]["reason"],
            "completed"
        );
    }

    #[test]
    fn test_instances_do_not_alias_the_template() {
        let templates = ProtocolTemplates::builtin().unwrap();
        let mut first = templates.instantiate("opened").unwrap();
        first["id"] = Value::String("changed".to_string());
        assert_eq!(templates.instantiate("opened").unwrap()["id"], "");
    }

    #[test]
    fn test_unknown_name_fails() {
        let templates = ProtocolTemplates::builtin().unwrap();
        match templates.instantiate("resumed") {
            Err(GatewayError::UnknownTemplate { name, available }) => {
                assert_eq!(name, "resumed");
                assert_eq!(available.len(), 4);
            }
            other => panic!("expected UnknownTemplate, got {:?}", other),
        }
    }

    #[test]
    fn test_directory_must_provide_required_templates() {
        let dir = std::env::temp_dir().join(format!("audiohook-templates-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("pong.json"), r#"{"type":"pong"}"#).unwrap();
        std::fs::write(dir.join("README.txt"), "ignored").unwrap();

        let err = ProtocolTemplates::from_dir(&dir).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownTemplate { .. }));

        for name in ["opened", "closed", "disconnect"] {
            std::fs::write(dir.join(format!("{}.json", name)), format!(r#"{{"type":"{}"}}"#, name)).unwrap();
        }
        let templates = ProtocolTemplates::from_dir(&dir).unwrap();
        assert_eq!(templates.names().len(), 4);

        let _ = std::fs::remove_dir_all(&dir);
    }
}

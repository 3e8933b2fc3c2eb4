/// Tools Module
///
/// This module contains all MCP tool and resource implementations. Each
/// module exports a `register` function that adds its capabilities to the
/// registry during server initialization.

pub mod echo;
pub mod scan;
pub mod templates;
pub mod vulnerabilities;

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use crate::core::error::ToolError;
use crate::core::registry::CapabilityRegistry;
use crate::scanner::{ScannerService, TemplateStore};

/// Register every tool and resource.
///
/// # Arguments
/// * `registry` - Registry to populate
/// * `scanner` - Scan orchestrator used by the scan tools and the report resource
/// * `templates` - Store backing the template tools and resource
pub fn register_all(registry: &CapabilityRegistry, scanner: Arc<ScannerService>, templates: Arc<TemplateStore>) {
    echo::register(registry);
    scan::register(registry, scanner.clone());
    templates::register(registry, templates);
    vulnerabilities::register(registry, scanner);
}

/// Decode tool arguments into `T`, reporting failures as invalid arguments.
pub(crate) fn parse_arguments<T: DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    let arguments = match arguments {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(arguments).map_err(|e| ToolError::invalid_arguments(format!("invalid arguments: {}", e)))
}

/// A required string argument that must not be blank.
pub(crate) fn require_non_empty(value: Option<String>, name: &str) -> Result<String, ToolError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ToolError::invalid_arguments(format!("invalid or missing {} parameter", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Args {
        name: Option<String>,
    }

    #[test]
    fn test_parse_arguments() {
        let args: Args = parse_arguments(json!({"name": "x"})).unwrap();
        assert_eq!(args.name.as_deref(), Some("x"));

        let args: Args = parse_arguments(Value::Null).unwrap();
        assert!(args.name.is_none());

        let err = parse_arguments::<Args>(json!({"name": 5})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn test_require_non_empty() {
        assert_eq!(require_non_empty(Some("a".into()), "name").unwrap(), "a");
        let err = require_non_empty(Some("  ".into()), "target").unwrap_err();
        assert_eq!(err.to_string(), "invalid or missing target parameter");
        assert!(require_non_empty(None, "target").is_err());
    }
}

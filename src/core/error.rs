// Error types for the MCP server
//
// Each layer has its own enum; protocol-level errors live in `protocol::RpcError`.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::protocol::RpcError;

/// Errors raised by the external scan engine boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to initialize scan engine: {0}")]
    Setup(String),

    #[error("scan engine execution failed: {0}")]
    Execution(String),

    #[error("scan was cancelled")]
    Cancelled,

    #[error("scan engine is closed")]
    Closed,

    #[error("scan engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the scan orchestrator.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to provision basic template at {path}: {source}")]
    Provision {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Template store errors.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(String),

    #[error("invalid template name '{0}': must be a plain file name")]
    InvalidName(String),

    #[error("template I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tool and resource handler errors.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{0}")]
    InvalidArguments(String),

    #[error("scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error("{0}")]
    Template(#[from] TemplateError),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("failed to serialize result: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ToolError {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        ToolError::InvalidArguments(message.into())
    }
}

impl From<ToolError> for RpcError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::InvalidArguments(message) => RpcError::invalid_params(message),
            ToolError::Template(err @ TemplateError::InvalidName(_)) => RpcError::invalid_params(err.to_string()),
            other => RpcError::internal_error(other.to_string()),
        }
    }
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::ErrorCode;

    #[test]
    fn test_invalid_arguments_map_to_invalid_params() {
        let rpc: RpcError = ToolError::invalid_arguments("invalid or missing target parameter").into();
        assert_eq!(rpc.code, ErrorCode::InvalidParams);
        assert_eq!(rpc.message, "invalid or missing target parameter");
    }

    #[test]
    fn test_scan_errors_wrap_engine_message() {
        let err = ToolError::from(ScanError::from(EngineError::Execution("nuclei exited with status 1".into())));
        let rpc: RpcError = err.into();
        assert_eq!(rpc.code, ErrorCode::InternalError);
        assert_eq!(rpc.message, "scan failed: scan engine execution failed: nuclei exited with status 1");
    }
}

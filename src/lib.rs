/// Nuclei MCP Server
///
/// Model Context Protocol server exposing the Nuclei vulnerability scanner:
/// - core: protocol types, capability registry, dispatcher, config, logging
/// - scanner: scan engine boundary, nuclei engine, result cache, orchestrator
/// - tools: MCP tools and resources built on the scanner

pub mod core;
pub mod scanner;
pub mod tools;

pub use crate::core::error::{ConfigError, EngineError, ScanError, TemplateError, ToolError};
pub use crate::core::registry::CapabilityRegistry;
pub use crate::core::server::McpServer;
pub use crate::core::utils::Config;

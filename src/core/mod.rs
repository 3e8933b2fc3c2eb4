/// Core Server Framework Module
///
/// This module contains the protocol-level building blocks:
/// - protocol.rs: JSON-RPC and MCP wire types
/// - registry.rs: tools, resources and their handlers
/// - server.rs: dispatcher with STDIO and HTTP transports
/// - error.rs: error types for every layer
/// - utils.rs: configuration loading
/// - logging.rs: tracing subscriber setup

pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod utils;

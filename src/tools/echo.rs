/// Echo Tool Implementation
///
/// Diagnostic tool that returns its arguments back to the client as JSON
/// text. Useful for checking a client connection end to end without running
/// a scan.

use serde_json::{Value, json};

use crate::core::error::ToolError;
use crate::core::protocol::{CallToolResult, Tool};
use crate::core::registry::{CapabilityRegistry, ToolContext};

/// Register the echo tool with the registry.
pub fn register(registry: &CapabilityRegistry) {
    let tool = Tool::new(
        "echo",
        "Echo the call arguments back to the client.",
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo"
                }
            },
            "additionalProperties": true
        }),
    );

    registry.register_tool(tool, |args: Value, _ctx: ToolContext| async move { echo(args) });
}

fn echo(args: Value) -> Result<CallToolResult, ToolError> {
    let text = serde_json::to_string(&args)?;
    Ok(CallToolResult::text(text))
}

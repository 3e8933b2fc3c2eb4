/// Template Tools
///
/// Manage custom nuclei templates stored in the template directory:
/// - `add_template`, `list_templates`, `get_template` tools
/// - `templates://{name}` resource template for reading a stored template

use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::core::error::ToolError;
use crate::core::protocol::{CallToolResult, ResourceContents, ResourceTemplate, Tool};
use crate::core::registry::{CapabilityRegistry, ToolContext};
use crate::scanner::TemplateStore;
use crate::tools::{parse_arguments, require_non_empty};

pub const TEMPLATE_URI_PREFIX: &str = "templates://";

#[derive(Debug, Deserialize)]
struct AddTemplateArgs {
    name: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetTemplateArgs {
    name: Option<String>,
}

/// Register the template tools and the template resource.
pub fn register(registry: &CapabilityRegistry, store: Arc<TemplateStore>) {
    let add = Tool::new(
        "add_template",
        "Adds a new Nuclei template.",
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "The name of the template file."},
                "content": {"type": "string", "description": "The content of the template file."}
            },
            "required": ["name", "content"]
        }),
    );
    let add_store = store.clone();
    registry.register_tool(add, move |args: Value, _ctx: ToolContext| {
        let store = add_store.clone();
        async move { handle_add(&store, args).await }
    });

    let list = Tool::new(
        "list_templates",
        "Lists all available Nuclei templates.",
        json!({"type": "object", "properties": {}}),
    );
    let list_store = store.clone();
    registry.register_tool(list, move |_args: Value, _ctx: ToolContext| {
        let store = list_store.clone();
        async move { handle_list(&store).await }
    });

    let get = Tool::new(
        "get_template",
        "Gets the content of a specific Nuclei template.",
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "The name of the template file."}
            },
            "required": ["name"]
        }),
    );
    let get_store = store.clone();
    registry.register_tool(get, move |args: Value, _ctx: ToolContext| {
        let store = get_store.clone();
        async move { handle_get(&store, args).await }
    });

    let template = ResourceTemplate {
        uri_template: format!("{}{{name}}", TEMPLATE_URI_PREFIX),
        name: "Nuclei Template".to_string(),
        description: Some("Content of a custom Nuclei template by file name".to_string()),
        mime_type: Some("text/yaml".to_string()),
        annotations: None,
    };
    registry.register_resource_template(template, move |uri: String| {
        let store = store.clone();
        async move { read_template_resource(&store, uri).await }
    });
}

async fn handle_add(store: &TemplateStore, args: Value) -> Result<CallToolResult, ToolError> {
    let args: AddTemplateArgs = parse_arguments(args)?;
    let name = require_non_empty(args.name, "name")?;
    let content = require_non_empty(args.content, "content")?;

    store.add_template(&name, content.as_bytes()).await?;
    info!(template = %name, "template added");
    Ok(CallToolResult::text(format!("Template '{}' added successfully.", name)))
}

async fn handle_list(store: &TemplateStore) -> Result<CallToolResult, ToolError> {
    let names = store.list_templates().await?;
    if names.is_empty() {
        return Ok(CallToolResult::text("No custom templates found."));
    }
    Ok(CallToolResult::text(format!("Available templates:\n- {}", names.join("\n- "))))
}

async fn handle_get(store: &TemplateStore, args: Value) -> Result<CallToolResult, ToolError> {
    let args: GetTemplateArgs = parse_arguments(args)?;
    let name = require_non_empty(args.name, "name")?;

    let content = store.get_template(&name).await?;
    Ok(CallToolResult::text(String::from_utf8_lossy(&content).into_owned()))
}

async fn read_template_resource(store: &TemplateStore, uri: String) -> Result<Vec<ResourceContents>, ToolError> {
    let name = uri
        .strip_prefix(TEMPLATE_URI_PREFIX)
        .ok_or_else(|| ToolError::ResourceNotFound(uri.clone()))?;
    let content = store.get_template(name).await?;
    Ok(vec![ResourceContents {
        uri: uri.clone(),
        mime_type: Some("text/yaml".to_string()),
        text: String::from_utf8_lossy(&content).into_owned(),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TemplateError;
    use crate::core::protocol::Content;

    fn text(result: &CallToolResult) -> &str {
        let Content::Text { text } = &result.content[0];
        text
    }

    async fn setup() -> (CapabilityRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TemplateStore::new(dir.path()).await.unwrap());
        let registry = CapabilityRegistry::new();
        register(&registry, store);
        (registry, dir)
    }

    #[tokio::test]
    async fn test_template_tools_round_trip() {
        let (registry, _dir) = setup().await;
        let tool = |name: &str| registry.find_tool(name).unwrap();

        let result = tool("list_templates").call(json!({}), ToolContext::default()).await.unwrap();
        assert_eq!(text(&result), "No custom templates found.");

        let result = tool("add_template")
            .call(json!({"name": "probe.yaml", "content": "id: probe\n"}), ToolContext::default())
            .await
            .unwrap();
        assert_eq!(text(&result), "Template 'probe.yaml' added successfully.");

        let result = tool("list_templates").call(json!({}), ToolContext::default()).await.unwrap();
        assert_eq!(text(&result), "Available templates:\n- probe.yaml");

        let result = tool("get_template")
            .call(json!({"name": "probe.yaml"}), ToolContext::default())
            .await
            .unwrap();
        assert_eq!(text(&result), "id: probe\n");
    }

    #[tokio::test]
    async fn test_template_tool_errors() {
        let (registry, _dir) = setup().await;

        let err = registry
            .find_tool("add_template")
            .unwrap()
            .call(json!({"name": "probe.yaml", "content": ""}), ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid or missing content parameter");

        let err = registry
            .find_tool("get_template")
            .unwrap()
            .call(json!({"name": "missing.yaml"}), ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Template(TemplateError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_template_resource() {
        let (registry, _dir) = setup().await;
        registry
            .find_tool("add_template")
            .unwrap()
            .call(json!({"name": "probe.yaml", "content": "id: probe\n"}), ToolContext::default())
            .await
            .unwrap();

        assert_eq!(registry.list_resource_templates()[0].uri_template, "templates://{name}");
        let handler = registry.match_resource_template("templates://probe.yaml").unwrap();
        let contents = handler.read("templates://probe.yaml".to_string()).await.unwrap();
        assert_eq!(contents[0].text, "id: probe\n");
        assert_eq!(contents[0].mime_type.as_deref(), Some("text/yaml"));
    }
}

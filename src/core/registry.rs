/// Capability Registry
///
/// Holds the tools, resources and resource templates the server exposes,
/// together with the handlers bound to them. All collections sit behind a
/// single read-write lock; list operations copy a snapshot out under the read
/// lock so concurrent registration never tears an in-progress listing.
///
/// Registering a tool or resource publishes a `ListChanged` event on a
/// broadcast channel. The protocol server subscribes while it is serving and
/// forwards the events to the client as list_changed notifications.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::error::ToolError;
use crate::core::protocol::{CallToolResult, Resource, ResourceContents, ResourceTemplate, Tool};

/// Per-call context handed to tool handlers.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Cancelled when the client sends `notifications/cancelled` for the request.
    pub cancel: CancellationToken,
}

/// Handler executed for `tools/call`.
///
/// Implemented for any `Fn(Value, ToolContext) -> impl Future` closure, which is
/// how every tool in this crate registers itself.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value, ctx: ToolContext) -> Result<CallToolResult, ToolError>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CallToolResult, ToolError>> + Send + 'static,
{
    async fn call(&self, arguments: Value, ctx: ToolContext) -> Result<CallToolResult, ToolError> {
        (self)(arguments, ctx).await
    }
}

/// Handler executed for `resources/read`. Receives the requested URI.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(&self, uri: String) -> Result<Vec<ResourceContents>, ToolError>;
}

#[async_trait]
impl<F, Fut> ResourceHandler for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<ResourceContents>, ToolError>> + Send + 'static,
{
    async fn read(&self, uri: String) -> Result<Vec<ResourceContents>, ToolError> {
        (self)(uri).await
    }
}

/// Which collection changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChanged {
    Tools,
    Resources,
}

impl ListChanged {
    /// Notification method sent to the client for this change.
    pub fn method(self) -> &'static str {
        match self {
            ListChanged::Tools => "notifications/tools/list_changed",
            ListChanged::Resources => "notifications/resources/list_changed",
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    tools: Vec<(Tool, Arc<dyn ToolHandler>)>,
    resources: Vec<(Resource, Arc<dyn ResourceHandler>)>,
    templates: Vec<(ResourceTemplate, Arc<dyn ResourceHandler>)>,
}

/// Registry of available MCP tools and resources.
pub struct CapabilityRegistry {
    inner: RwLock<RegistryInner>,
    changes: broadcast::Sender<ListChanged>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            changes,
        }
    }

    /// Register a tool with the registry.
    ///
    /// A tool whose name is already registered is replaced in place
    /// (last write wins).
    ///
    /// # Arguments
    /// * `tool` - Tool definition with name, description, and input schema
    /// * `handler` - Function that executes the tool when called
    pub fn register_tool(&self, tool: Tool, handler: impl ToolHandler + 'static) {
        let handler: Arc<dyn ToolHandler> = Arc::new(handler);
        {
            let mut inner = self.inner.write();
            match inner.tools.iter().position(|(t, _)| t.name == tool.name) {
                Some(idx) => inner.tools[idx] = (tool, handler),
                None => inner.tools.push((tool, handler)),
            }
        }
        self.publish(ListChanged::Tools);
    }

    /// Register a resource. A duplicate URI replaces the earlier entry.
    pub fn register_resource(&self, resource: Resource, handler: impl ResourceHandler + 'static) {
        let handler: Arc<dyn ResourceHandler> = Arc::new(handler);
        {
            let mut inner = self.inner.write();
            match inner.resources.iter().position(|(r, _)| r.uri == resource.uri) {
                Some(idx) => inner.resources[idx] = (resource, handler),
                None => inner.resources.push((resource, handler)),
            }
        }
        self.publish(ListChanged::Resources);
    }

    /// Register a resource template. Templates do not trigger notifications.
    pub fn register_resource_template(&self, template: ResourceTemplate, handler: impl ResourceHandler + 'static) {
        let handler: Arc<dyn ResourceHandler> = Arc::new(handler);
        self.inner.write().templates.push((template, handler));
    }

    pub fn list_tools(&self) -> Vec<Tool> {
        self.inner.read().tools.iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        self.inner.read().resources.iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn list_resource_templates(&self) -> Vec<ResourceTemplate> {
        self.inner.read().templates.iter().map(|(t, _)| t.clone()).collect()
    }

    /// Look up the handler bound to a tool name.
    pub fn find_tool(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.inner
            .read()
            .tools
            .iter()
            .find(|(t, _)| t.name == name)
            .map(|(_, h)| h.clone())
    }

    /// Look up the handler bound to an exact resource URI.
    pub fn find_resource(&self, uri: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.inner
            .read()
            .resources
            .iter()
            .find(|(r, _)| r.uri == uri)
            .map(|(_, h)| h.clone())
    }

    /// Find the first resource template whose literal prefix matches `uri`.
    pub fn match_resource_template(&self, uri: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.inner
            .read()
            .templates
            .iter()
            .find(|(t, _)| {
                let prefix = t.prefix();
                !prefix.is_empty() && uri.len() > prefix.len() && uri.starts_with(prefix)
            })
            .map(|(_, h)| h.clone())
    }

    /// Subscribe to list-changed events.
    pub fn subscribe(&self) -> broadcast::Receiver<ListChanged> {
        self.changes.subscribe()
    }

    fn publish(&self, change: ListChanged) {
        // No receivers simply means nobody is serving yet.
        if self.changes.send(change).is_err() {
            tracing::trace!(method = change.method(), "no list_changed subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_tool(name: &str, description: &str) -> Tool {
        Tool::new(name, description, json!({"type": "object"}))
    }

    async fn ok_handler(_args: Value, _ctx: ToolContext) -> Result<CallToolResult, ToolError> {
        Ok(CallToolResult::text("ok"))
    }

    #[tokio::test]
    async fn test_register_and_find_tool() {
        let registry = CapabilityRegistry::new();
        registry.register_tool(noop_tool("echo", "Echo"), ok_handler);

        let handler = registry.find_tool("echo").expect("echo registered");
        let result = handler.call(json!({}), ToolContext::default()).await.unwrap();
        assert_eq!(result, CallToolResult::text("ok"));
        assert!(registry.find_tool("missing").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_last_write_wins() {
        let registry = CapabilityRegistry::new();
        registry.register_tool(noop_tool("scan", "first"), ok_handler);
        registry.register_tool(noop_tool("other", "other"), ok_handler);
        registry.register_tool(noop_tool("scan", "second"), |_args: Value, _ctx: ToolContext| async {
            Ok::<_, ToolError>(CallToolResult::text("second"))
        });

        let tools = registry.list_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "scan");
        assert_eq!(tools[0].description, "second");

        let result = registry.find_tool("scan").unwrap().call(json!({}), ToolContext::default()).await.unwrap();
        assert_eq!(result, CallToolResult::text("second"));
    }

    #[test]
    fn test_snapshot_is_independent_of_later_registration() {
        let registry = CapabilityRegistry::new();
        registry.register_tool(noop_tool("a", "a"), ok_handler);
        let snapshot = registry.list_tools();
        registry.register_tool(noop_tool("b", "b"), ok_handler);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.list_tools().len(), 2);
    }

    #[test]
    fn test_registration_publishes_changes() {
        let registry = CapabilityRegistry::new();
        let mut rx = registry.subscribe();

        registry.register_tool(noop_tool("a", "a"), ok_handler);
        registry.register_resource(
            Resource {
                uri: "vulnerabilities".into(),
                name: "Recent Vulnerability Reports".into(),
                description: None,
                mime_type: None,
                annotations: None,
            },
            |_uri: String| async { Ok::<Vec<ResourceContents>, ToolError>(Vec::new()) },
        );

        assert_eq!(rx.try_recv().unwrap(), ListChanged::Tools);
        assert_eq!(rx.try_recv().unwrap(), ListChanged::Resources);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_resource_templates_match_by_prefix() {
        let registry = CapabilityRegistry::new();
        let mut rx = registry.subscribe();
        registry.register_resource_template(
            ResourceTemplate {
                uri_template: "templates://{name}".into(),
                name: "Nuclei template".into(),
                description: None,
                mime_type: None,
                annotations: None,
            },
            |_uri: String| async { Ok::<Vec<ResourceContents>, ToolError>(Vec::new()) },
        );

        assert!(registry.match_resource_template("templates://basic.yaml").is_some());
        assert!(registry.match_resource_template("templates://").is_none());
        assert!(registry.match_resource_template("vulnerabilities").is_none());
        assert_eq!(registry.list_resource_templates().len(), 1);
        assert!(rx.try_recv().is_err());
    }
}

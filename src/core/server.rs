/// MCP Server Implementation
///
/// This module contains the protocol dispatcher and its transports:
/// - `McpServer`: initialization state machine and method dispatch
/// - `serve`: newline-delimited JSON-RPC loop over any reader/writer pair
/// - `run_server_stdio`: `serve` bound to stdin/stdout
/// - `run_server_http`: Actix Web transport, one request per POST body
///
/// All logging goes to stderr; stdout carries only protocol messages.

use actix_web::{
    App, HttpResponse, HttpServer, web,
    middleware::{Compress, DefaultHeaders, Logger},
};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::protocol::{
    CallToolParams, DEFAULT_PROTOCOL_VERSION, ErrorCode, Implementation, InitializeParams, InitializeResult,
    JSONRPC_VERSION, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListChangedCapability,
    ReadResourceParams, RequestId, ResourcesCapability, RpcError, SUPPORTED_PROTOCOL_VERSIONS,
    ServerCapabilities,
};
use crate::core::registry::{CapabilityRegistry, ListChanged, ToolContext};

/// Buffer size for the line reader and writer.
const IO_BUFFER_SIZE: usize = 8192;

/// Request methods understood by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Initialize,
    Ping,
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourceTemplatesList,
    ResourcesRead,
    Unknown(String),
}

impl Method {
    pub fn parse(name: &str) -> Self {
        match name {
            "initialize" => Method::Initialize,
            "ping" => Method::Ping,
            "tools/list" => Method::ToolsList,
            "tools/call" => Method::ToolsCall,
            "resources/list" => Method::ResourcesList,
            "resources/templates/list" => Method::ResourceTemplatesList,
            "resources/read" => Method::ResourcesRead,
            other => Method::Unknown(other.to_string()),
        }
    }

    /// Whether the method may be called before `initialize`.
    fn allowed_uninitialized(&self) -> bool {
        matches!(self, Method::Initialize | Method::Ping | Method::Unknown(_))
    }
}

/// Why an inbound line could not be turned into a request.
#[derive(Debug)]
pub enum DecodeError {
    /// Not JSON at all.
    Malformed(serde_json::Error),
    /// JSON, but not a request envelope. Carries the id if one was readable.
    Invalid(Option<RequestId>),
}

/// Decode one inbound message.
pub fn decode_message(text: &str) -> Result<JsonRpcRequest, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
    let id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

    match serde_json::from_value::<JsonRpcRequest>(value) {
        Ok(request) if request.jsonrpc == JSONRPC_VERSION => Ok(request),
        _ => Err(DecodeError::Invalid(id)),
    }
}

/// Protocol dispatcher shared by every transport.
///
/// Starts uninitialized; a successful `initialize` moves it to initialized
/// for the rest of its lifetime.
pub struct McpServer {
    info: Implementation,
    instructions: Option<String>,
    registry: Arc<CapabilityRegistry>,
    initialized: AtomicBool,
    /// Cancellation tokens of running tools/call requests.
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl McpServer {
    /// Create a new server.
    ///
    /// # Arguments
    /// * `info` - Name and version reported in initialize responses
    /// * `registry` - Tools and resources to expose
    pub fn new(info: Implementation, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            info,
            instructions: None,
            registry,
            initialized: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Handle one decoded message.
    ///
    /// Returns the response for requests, `None` for notifications.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let JsonRpcRequest { id, method, params, .. } = request;
        let Some(id) = id else {
            self.handle_notification(&method, params);
            return None;
        };

        debug!(%id, method = %method, "handling request");
        let response = match self.dispatch(&id, Method::parse(&method), params).await {
            Ok(result) => JsonRpcResponse::success(Some(id), result),
            Err(err) => {
                debug!(%id, code = err.code.code(), message = %err.message, "request failed");
                JsonRpcResponse::error(Some(id), err)
            }
        };
        Some(response)
    }

    /// Route a request to its method handler.
    async fn dispatch(&self, id: &RequestId, method: Method, params: Option<Value>) -> Result<Value, RpcError> {
        if !method.allowed_uninitialized() && !self.is_initialized() {
            return Err(RpcError::not_initialized());
        }

        match method {
            Method::Initialize => self.initialize(params),
            Method::Ping => Ok(json!({})),
            Method::ToolsList => Ok(json!({ "tools": self.registry.list_tools() })),
            Method::ToolsCall => self.call_tool(id, params).await,
            Method::ResourcesList => Ok(json!({ "resources": self.registry.list_resources() })),
            Method::ResourceTemplatesList => {
                Ok(json!({ "resourceTemplates": self.registry.list_resource_templates() }))
            }
            Method::ResourcesRead => self.read_resource(params).await,
            Method::Unknown(name) => Err(RpcError::method_not_found(&name)),
        }
    }

    /// Handle the initialize method.
    ///
    /// Echoes the client's protocol version when supported, otherwise answers
    /// with the default version. Calling it again re-negotiates.
    fn initialize(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let params: InitializeParams = parse_params(params)?;
        let protocol_version = if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
            params.protocol_version
        } else {
            DEFAULT_PROTOCOL_VERSION.to_string()
        };

        info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol_version = %protocol_version,
            "client initialized"
        );
        self.initialized.store(true, Ordering::Release);

        let result = InitializeResult {
            protocol_version,
            capabilities: ServerCapabilities {
                tools: Some(ListChangedCapability { list_changed: Some(true) }),
                resources: Some(ResourcesCapability {
                    subscribe: Some(false),
                    list_changed: Some(true),
                }),
            },
            server_info: self.info.clone(),
            instructions: self.instructions.clone(),
        };
        to_result(&result)
    }

    /// Handle the tools/call method.
    ///
    /// The handler runs with a cancellation token registered under the
    /// request id. A panicking handler is reported as an internal error.
    async fn call_tool(&self, id: &RequestId, params: Option<Value>) -> Result<Value, RpcError> {
        let params: CallToolParams = parse_params(params)?;
        let handler = self
            .registry
            .find_tool(&params.name)
            .ok_or_else(|| RpcError::tool_not_found(&params.name))?;

        // A reused id would make notifications/cancelled ambiguous.
        let cancel = CancellationToken::new();
        match self.in_flight.lock().entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(RpcError::invalid_request(format!("request id {} is already in flight", id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }
        let ctx = ToolContext { cancel };

        let arguments = params.arguments.unwrap_or_else(|| json!({}));
        let outcome = AssertUnwindSafe(handler.call(arguments, ctx)).catch_unwind().await;
        self.in_flight.lock().remove(id);

        match outcome {
            Ok(Ok(result)) => to_result(&result),
            Ok(Err(e)) => {
                warn!(tool = %params.name, error = %e, "tool call failed");
                Err(e.into())
            }
            Err(_) => {
                error!(tool = %params.name, "tool handler panicked");
                Err(RpcError::internal_error("tool handler panicked"))
            }
        }
    }

    /// Handle the resources/read method.
    async fn read_resource(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let params: ReadResourceParams = parse_params(params)?;
        let handler = self
            .registry
            .find_resource(&params.uri)
            .or_else(|| self.registry.match_resource_template(&params.uri))
            .ok_or_else(|| RpcError::invalid_params(format!("resource not found: {}", params.uri)))?;

        let contents = handler.read(params.uri).await.map_err(RpcError::from)?;
        Ok(json!({ "contents": contents }))
    }

    /// Handle a client notification. Notifications never get a response.
    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            "notifications/initialized" => {}
            "notifications/cancelled" => {
                let request_id = params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
                let token = request_id.as_ref().and_then(|id| self.in_flight.lock().get(id).cloned());
                match request_id.zip(token) {
                    Some((id, token)) => {
                        info!(%id, "cancelling tool call");
                        token.cancel();
                    }
                    None => debug!("cancellation for unknown request ignored"),
                }
            }
            other => debug!(method = other, "ignoring notification"),
        }
    }

    /// Serve newline-delimited JSON-RPC over `reader` and `writer`.
    ///
    /// tools/call requests run in spawned tasks; every other request is
    /// answered inline in arrival order. List-changed events from the
    /// registry are forwarded as notifications while serving. Returns at end
    /// of input once every running tool call has been answered.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_lines(writer, rx));
        let forwarder = tokio::spawn(forward_list_changed(self.registry.subscribe(), tx.clone()));

        let mut calls = JoinSet::new();
        let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, reader);
        let mut buf = Vec::with_capacity(IO_BUFFER_SIZE);

        let read_result = loop {
            // Reap finished tool calls so the set stays small.
            while let Some(joined) = calls.try_join_next() {
                log_join(joined);
            }

            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "failed to read input");
                    break Err(e);
                }
            }

            let text = match std::str::from_utf8(&buf) {
                Ok(text) => text.trim(),
                Err(e) => {
                    warn!(error = %e, "discarding message that is not valid UTF-8");
                    continue;
                }
            };
            if text.is_empty() {
                continue;
            }

            let request = match decode_message(text) {
                Ok(request) => request,
                Err(DecodeError::Malformed(e)) => {
                    warn!(error = %e, "discarding malformed message");
                    continue;
                }
                Err(DecodeError::Invalid(Some(id))) => {
                    warn!(%id, "invalid request envelope");
                    send(&tx, &JsonRpcResponse::error(Some(id), RpcError::invalid_request("Invalid Request")));
                    continue;
                }
                Err(DecodeError::Invalid(None)) => {
                    warn!("discarding message that is not a request");
                    continue;
                }
            };

            if !request.is_notification() && Method::parse(&request.method) == Method::ToolsCall {
                let server = self.clone();
                let tx = tx.clone();
                calls.spawn(async move {
                    if let Some(response) = server.handle_request(request).await {
                        send(&tx, &response);
                    }
                });
            } else if let Some(response) = self.handle_request(request).await {
                send(&tx, &response);
            }
        };

        while let Some(joined) = calls.join_next().await {
            log_join(joined);
        }

        forwarder.abort();
        let _ = forwarder.await;
        drop(tx);
        if let Err(e) = writer_task.await {
            error!(error = %e, "writer task failed");
        }

        debug!("input closed, serving loop finished");
        read_result
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let params = params.ok_or_else(|| RpcError::invalid_params("missing params"))?;
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(format!("invalid params: {}", e)))
}

fn to_result<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal_error(format!("failed to serialize result: {}", e)))
}

fn send<T: Serialize>(tx: &mpsc::UnboundedSender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            if tx.send(line).is_err() {
                debug!("writer closed, dropping outbound message");
            }
        }
        Err(e) => error!(error = %e, "failed to serialize outbound message"),
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "tool call task failed");
    }
}

/// Single writer: one message per line, flushed after each.
async fn write_lines<W: AsyncWrite + Unpin>(writer: W, mut rx: mpsc::UnboundedReceiver<String>) {
    let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, writer);
    while let Some(line) = rx.recv().await {
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            error!(error = %e, "failed to write output");
            break;
        }
    }
}

async fn forward_list_changed(mut changes: broadcast::Receiver<ListChanged>, tx: mpsc::UnboundedSender<String>) {
    loop {
        match changes.recv().await {
            Ok(change) => {
                debug!(method = change.method(), "sending list_changed notification");
                send(&tx, &JsonRpcNotification::new(change.method()));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "list_changed events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Run the MCP server in STDIO mode.
///
/// Reads JSON-RPC requests line by line from stdin and writes responses and
/// notifications to stdout until stdin closes.
pub async fn run_server_stdio(server: Arc<McpServer>) -> std::io::Result<()> {
    info!(
        name = %server.info.name,
        version = %server.info.version,
        "MCP server starting (STDIO mode)"
    );
    server.serve(tokio::io::stdin(), tokio::io::stdout()).await
}

/// Health check endpoint handler.
async fn health(server: web::Data<McpServer>) -> actix_web::Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": server.info.name,
    })))
}

/// MCP JSON-RPC request handler for HTTP mode.
///
/// One JSON-RPC message per body. Notifications are accepted with
/// `202 Accepted` and an empty body.
async fn mcp_handler(server: web::Data<McpServer>, body: String) -> actix_web::Result<HttpResponse> {
    let request = match decode_message(body.trim()) {
        Ok(request) => request,
        Err(DecodeError::Malformed(e)) => {
            warn!(error = %e, "malformed HTTP request body");
            let err = RpcError::new(ErrorCode::ParseError, format!("Parse error: {}", e));
            return Ok(HttpResponse::BadRequest().json(JsonRpcResponse::error(None, err)));
        }
        Err(DecodeError::Invalid(id)) => {
            return Ok(HttpResponse::BadRequest().json(JsonRpcResponse::error(
                id,
                RpcError::invalid_request("Invalid Request"),
            )));
        }
    };

    match server.handle_request(request).await {
        Some(response) => Ok(HttpResponse::Ok().json(response)),
        None => Ok(HttpResponse::Accepted().finish()),
    }
}

/// Routes served in HTTP mode.
fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/mcp", web::post().to(mcp_handler))
        .route("/", web::post().to(mcp_handler))
        .route("/", web::get().to(health));
}

/// Run the MCP server in HTTP mode.
///
/// # Arguments
/// * `server` - Dispatcher shared by every worker; initialization state is
///   common to all HTTP clients
/// * `host` - Bind address
/// * `port` - Port number to listen on
/// * `workers` - Worker thread count
pub async fn run_server_http(server: Arc<McpServer>, host: String, port: u16, workers: usize) -> std::io::Result<()> {
    use std::time::Duration;

    let bind_addr = format!("{}:{}", host, port);
    info!(
        name = %server.info.name,
        version = %server.info.version,
        bind = %bind_addr,
        workers,
        "MCP server starting (HTTP mode)"
    );

    let data = web::Data::from(server);

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            // add_template bodies can exceed the 256 KiB default.
            .app_data(web::PayloadConfig::new(4 * 1024 * 1024))
            .wrap(Compress::default())
            .wrap(
                DefaultHeaders::new()
                    .add(("X-Content-Type-Options", "nosniff"))
                    .add(("X-Frame-Options", "DENY")),
            )
            .wrap(Logger::new("%r %s %Dms"))
            .configure(configure_routes)
    })
    .workers(workers)
    .keep_alive(Duration::from_secs(30))
    .client_request_timeout(Duration::from_secs(30))
    .client_disconnect_timeout(Duration::from_secs(2))
    .shutdown_timeout(10)
    .bind(&bind_addr)?
    .run()
    .await
}

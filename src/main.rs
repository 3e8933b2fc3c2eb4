/// Nuclei MCP Server Entry Point
///
/// Parses the command line, loads configuration (file, then environment,
/// then flags), wires the scanner and tools together and starts the selected
/// transport:
/// - stdio: JSON-RPC over stdin/stdout, for MCP clients that spawn the server
/// - http: Actix Web endpoint
/// - both: stdio in the background, HTTP in the foreground
///
/// See `core::utils` for configuration keys and environment variables.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use nuclei_mcp::core::logging::init_logging;
use nuclei_mcp::core::protocol::Implementation;
use nuclei_mcp::core::server::{self, McpServer};
use nuclei_mcp::core::utils::{Config, TransportMode};
use nuclei_mcp::scanner::{NucleiEngineFactory, NucleiOptions, ResultCache, ScannerService, TemplateStore};
use nuclei_mcp::{CapabilityRegistry, tools};

const INSTRUCTIONS: &str = "Use nuclei_scan to scan a target with severity, protocol and template filters, \
or basic_scan for a quick single-template check. Results are cached; the 'vulnerabilities' resource \
summarizes recent scans. Manage custom templates with add_template, list_templates and get_template.";

#[derive(Parser)]
#[command(name = "nuclei-mcp")]
#[command(about = "MCP server exposing Nuclei vulnerability scanning", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (defaults to ./config.yaml, ~/.nuclei-mcp/config.yaml, /etc/nuclei-mcp/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Transport: stdio, http, or both
    #[arg(long)]
    transport: Option<TransportMode>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(transport) = cli.transport {
        config.server.transport = transport;
    }

    init_logging(&config.logging, cli.log_level.as_deref()).context("failed to initialize logging")?;

    info!(
        name = %config.server.name,
        version = %config.server.version,
        transport = ?config.server.transport,
        nuclei = %config.nuclei.binary.display(),
        cache_enabled = config.cache.enabled,
        cache_expiry = %humantime::format_duration(config.cache.expiry),
        "starting nuclei MCP server"
    );

    let cache = Arc::new(ResultCache::new(config.cache.expiry));
    let factory = Arc::new(NucleiEngineFactory::new(NucleiOptions::from(&config.nuclei)));
    let scanner = Arc::new(
        ScannerService::new(cache, factory, config.nuclei.basic_templates_directory.clone())
            .with_cache_enabled(config.cache.enabled),
    );
    let templates = Arc::new(
        TemplateStore::new(config.nuclei.templates_directory.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to create templates directory {}",
                    config.nuclei.templates_directory.display()
                )
            })?,
    );

    let registry = Arc::new(CapabilityRegistry::new());
    tools::register_all(&registry, scanner.clone(), templates);

    let info = Implementation {
        name: config.server.name.clone(),
        version: config.server.version.clone(),
    };
    let server = Arc::new(McpServer::new(info, registry).with_instructions(INSTRUCTIONS));

    let result = match config.server.transport {
        TransportMode::Stdio => run_stdio(server).await,
        TransportMode::Http => server::run_server_http(
            server,
            config.server.host.clone(),
            config.server.port,
            config.http_workers(),
        )
        .await
        .context("HTTP server failed"),
        TransportMode::Both => {
            let stdio_server = server.clone();
            let stdio_handle = tokio::spawn(async move {
                if let Err(e) = server::run_server_stdio(stdio_server).await {
                    warn!(error = %e, "STDIO server error");
                }
            });

            let http_result = server::run_server_http(
                server,
                config.server.host.clone(),
                config.server.port,
                config.http_workers(),
            )
            .await
            .context("HTTP server failed");

            stdio_handle.abort();
            http_result
        }
    };

    if let Err(e) = scanner.shutdown().await {
        warn!(error = %e, "failed to close scan engine");
    }
    info!("server stopped");
    result
}

/// Serve STDIO until input closes or a shutdown signal arrives.
async fn run_stdio(server: Arc<McpServer>) -> Result<()> {
    tokio::select! {
        result = server::run_server_stdio(server) => result.context("STDIO server failed"),
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tracing::info;

use k8s_mcp::kube::{ContextManager, McpKubeCommands, TunnelManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    // Setup MCP server
    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    // Managers are shared across every MCP session
    let contexts = Arc::new(ContextManager::new());
    let tunnels = Arc::new(TunnelManager::new(Arc::clone(&contexts)));

    let endpoint_contexts = Arc::clone(&contexts);
    let endpoint_tunnels = Arc::clone(&tunnels);
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| {
                McpServer::new().tools(McpKubeCommands::new(
                    Arc::clone(&endpoint_contexts),
                    Arc::clone(&endpoint_tunnels),
                ))
            }),
        )
        .with(Tracing);

    info!("MCP Server with Kubernetes context support is ready");
    info!("Use the k8s_load_kubeconfig command to register contexts");
    info!("Use the k8s_port_forward command to open tunnels");

    // Run until interrupted, then drain tunnel sessions
    Server::new(TcpListener::bind(mcp_addr))
        .name("K8s MCP Server")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown signal received");
            },
            None,
        )
        .await?;

    tunnels.shutdown().await;

    Ok(())
}

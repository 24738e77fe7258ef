#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use k8s_mcp::kube::{ContextManager, McpKubeCommands, TunnelManager};
use poem_mcpserver::McpServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let contexts = Arc::new(ContextManager::new());
    let tunnels = Arc::new(TunnelManager::new(Arc::clone(&contexts)));

    poem_mcpserver::stdio::stdio(
        McpServer::new().tools(McpKubeCommands::new(contexts, Arc::clone(&tunnels))),
    )
    .await?;

    tunnels.shutdown().await;
    Ok(())
}

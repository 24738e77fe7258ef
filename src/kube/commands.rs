//! MCP tool surface for context and tunnel management.
//!
//! Every tool delegates to [`ContextManager`] or [`TunnelManager`] and maps
//! domain errors to strings at this boundary, which is the shape the MCP
//! protocol expects for tool failures.

use std::sync::Arc;

use poem_mcpserver::{Tools, tool::StructuredContent};
use tracing::{info, warn};

use super::context::ContextManager;
use super::tunnel::{TunnelManager, TunnelRequest};
use super::types::{
    ClusterListResponse, ContextListResponse, ContextOpResponse, LoadKubeconfigResponse,
    TargetKind, TunnelListResponse, TunnelStartResponse, TunnelStopResponse,
};

pub struct McpKubeCommands {
    contexts: Arc<ContextManager>,
    tunnels: Arc<TunnelManager>,
}

impl McpKubeCommands {
    pub fn new(contexts: Arc<ContextManager>, tunnels: Arc<TunnelManager>) -> Self {
        Self { contexts, tunnels }
    }
}

#[Tools]
impl McpKubeCommands {
    /// Load a kubeconfig file and register every context it defines under
    /// the given name. Omitting the path falls back to $KUBECONFIG and then
    /// to ~/.kube/config.
    async fn k8s_load_kubeconfig(
        &self,
        name: String,
        path: Option<String>,
    ) -> Result<StructuredContent<LoadKubeconfigResponse>, String> {
        info!("Loading kubeconfig under name {}", name);

        let outcome = self
            .contexts
            .load_kubeconfig(&name, path.as_deref().unwrap_or(""))
            .await
            .map_err(|e| {
                warn!("Failed to load kubeconfig {}: {}", name, e);
                e.to_string()
            })?;

        let message = format!("Registered {} contexts under {}", outcome.added.len(), name);
        Ok(StructuredContent(LoadKubeconfigResponse {
            added: outcome.added,
            active: outcome.active,
            message,
        }))
    }

    /// List all registered contexts with their metadata and active flag
    async fn k8s_list_contexts(&self) -> StructuredContent<ContextListResponse> {
        let contexts = self.contexts.list_contexts();
        let count = contexts.len();
        StructuredContent(ContextListResponse { contexts, count })
    }

    /// List the distinct cluster identifiers across all registered contexts
    async fn k8s_list_clusters(&self) -> StructuredContent<ClusterListResponse> {
        let clusters = self.contexts.list_clusters();
        let count = clusters.len();
        StructuredContent(ClusterListResponse { clusters, count })
    }

    /// Switch the active context and persist the selection into its source
    /// kubeconfig file
    async fn k8s_switch_context(
        &self,
        name: String,
    ) -> Result<StructuredContent<ContextOpResponse>, String> {
        self.contexts.set_current_context(&name).map_err(|e| {
            warn!("Failed to switch context to {}: {}", name, e);
            e.to_string()
        })?;

        Ok(StructuredContent(ContextOpResponse {
            name: name.clone(),
            message: format!("Switched active context to {}", name),
        }))
    }

    /// Rename a registered context, keeping its connection and active state
    async fn k8s_rename_context(
        &self,
        old_name: String,
        new_name: String,
    ) -> Result<StructuredContent<ContextOpResponse>, String> {
        self.contexts
            .rename_context(&old_name, &new_name)
            .map_err(|e| {
                warn!("Failed to rename context {}: {}", old_name, e);
                e.to_string()
            })?;

        Ok(StructuredContent(ContextOpResponse {
            name: new_name.clone(),
            message: format!("Renamed context {} to {}", old_name, new_name),
        }))
    }

    /// Remove a context and its connection; if it was active, the smallest
    /// remaining context is promoted
    async fn k8s_delete_context(
        &self,
        name: String,
    ) -> Result<StructuredContent<ContextOpResponse>, String> {
        self.contexts.delete_context(&name).map_err(|e| {
            warn!("Failed to delete context {}: {}", name, e);
            e.to_string()
        })?;

        Ok(StructuredContent(ContextOpResponse {
            name: name.clone(),
            message: format!("Deleted context {}", name),
        }))
    }

    /// Override the default namespace of the active context (in memory only)
    async fn k8s_set_namespace(
        &self,
        namespace: String,
    ) -> Result<StructuredContent<ContextOpResponse>, String> {
        self.contexts
            .set_current_namespace(&namespace)
            .map_err(|e| e.to_string())?;

        let name = self.contexts.current_context().unwrap_or_default();
        Ok(StructuredContent(ContextOpResponse {
            name,
            message: format!("Default namespace set to {}", namespace),
        }))
    }

    /// Start a port-forward tunnel from 127.0.0.1 to a pod or service in
    /// the active context. Local port 0 requests an ephemeral port; the
    /// response reports the port actually bound.
    async fn k8s_port_forward(
        &self,
        target_kind: TargetKind,
        target_name: String,
        remote_port: u16,
        local_port: Option<u16>,
        namespace: Option<String>,
    ) -> Result<StructuredContent<TunnelStartResponse>, String> {
        let request = TunnelRequest {
            namespace,
            target_kind,
            target_name,
            local_port: local_port.unwrap_or(0),
            remote_port,
        };

        let tunnel = self.tunnels.start(request).await.map_err(|e| {
            warn!("Failed to start tunnel: {}", e);
            e.to_string()
        })?;

        let message = format!(
            "Tunnel {} active: 127.0.0.1:{} -> {} {}/{}:{}",
            tunnel.id,
            tunnel.local_port,
            tunnel.target_kind,
            tunnel.namespace,
            tunnel.pod_name,
            tunnel.remote_port
        );
        Ok(StructuredContent(TunnelStartResponse { tunnel, message }))
    }

    /// Stop a running tunnel session by id
    async fn k8s_stop_port_forward(
        &self,
        id: u64,
    ) -> Result<StructuredContent<TunnelStopResponse>, String> {
        self.tunnels.stop(id).map_err(|e| e.to_string())?;

        Ok(StructuredContent(TunnelStopResponse {
            id,
            message: format!("Stopped tunnel {}", id),
        }))
    }

    /// List all live tunnel sessions
    async fn k8s_list_port_forwards(&self) -> StructuredContent<TunnelListResponse> {
        let tunnels = self.tunnels.list();
        let count = tunnels.len();
        StructuredContent(TunnelListResponse { tunnels, count })
    }
}

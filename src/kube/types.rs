//! Serializable types for MCP Kubernetes tools.
//!
//! This module contains the request and response types used by the MCP
//! Kubernetes commands, plus the two registry value types that cross the API
//! boundary: [`ContextInfo`] and [`TunnelInfo`]. Both are handed to callers
//! by value only; the registries never leak live references, so external
//! mutation cannot corrupt manager state.
//!
//! All types implement `Serialize`, `Deserialize`, and `JsonSchema` for
//! proper MCP protocol compatibility.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One loaded connection identity.
///
/// Copies of this struct are what callers receive from `list_contexts` and
/// `get_context_info`; mutating a copy has no effect on the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ContextInfo {
    /// Unique registry key, namespaced under the load name (e.g. "primary-c1")
    pub name: String,
    /// Cluster identifier from the kubeconfig
    pub cluster: String,
    /// User identifier from the kubeconfig
    pub user: String,
    /// Default namespace for this context
    pub namespace: String,
    /// API server URL
    pub server: String,
    /// Path of the kubeconfig file this context was loaded from
    pub source_path: String,
    /// Whether this is the single active context
    pub active: bool,
}

/// Kind of tunnel target: a workload directly, or a service fronting one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Forward directly to a named pod
    Pod,
    /// Resolve a running pod through the service's label selector
    Service,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Pod => write!(f, "pod"),
            TargetKind::Service => write!(f, "service"),
        }
    }
}

/// One in-flight local-to-remote tunnel session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TunnelInfo {
    /// Manager-assigned monotonically increasing session id
    pub id: u64,
    /// Namespace the target lives in
    pub namespace: String,
    /// Logical target name as requested by the caller
    pub target_name: String,
    /// Whether the target was a pod or a service
    pub target_kind: TargetKind,
    /// Pod the tunnel actually forwards to (resolved from the service if needed)
    pub pod_name: String,
    /// Local port the listener is bound to (transport-assigned when 0 was requested)
    pub local_port: u16,
    /// Remote port on the pod
    pub remote_port: u16,
    /// When the tunnel became ready (RFC3339 format)
    pub started_at: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct LoadKubeconfigResponse {
    /// Registry keys added by this load
    pub added: Vec<String>,
    /// Active context after the load, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ContextListResponse {
    /// All registered contexts (copies, safe to mutate)
    pub contexts: Vec<ContextInfo>,
    /// Total number of registered contexts
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ClusterListResponse {
    /// Cluster identifiers across all registered contexts
    pub clusters: Vec<String>,
    pub count: usize,
}

/// Generic response for context mutations (switch, rename, delete, namespace).
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ContextOpResponse {
    /// Context the operation applied to
    pub name: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TunnelStartResponse {
    pub tunnel: TunnelInfo,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TunnelStopResponse {
    /// Session id that was stopped
    pub id: u64,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TunnelListResponse {
    /// Point-in-time snapshot of all registered tunnel sessions
    pub tunnels: Vec<TunnelInfo>,
    /// Total number of active sessions
    pub count: usize,
}

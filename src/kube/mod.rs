//! MCP Kubernetes module providing context lifecycle and tunnel tools.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Serializable request and response types for MCP tools
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Domain errors and transient-failure classification
//! - `kubeconfig`: Kubeconfig path resolution, parsing, and persistence
//! - `client`: Client construction and the connectivity probe
//! - `context`: Context registry with the single-active-context rule
//! - `forward`: Local TCP listener and per-connection bridging
//! - `tunnel`: Concurrent tunnel session management
//! - `commands`: MCP tool implementations

pub mod client;
pub mod commands;
pub(crate) mod config;
pub mod context;
pub mod error;
pub(crate) mod forward;
pub(crate) mod kubeconfig;
pub mod tunnel;
pub mod types;

pub use commands::McpKubeCommands;
pub use context::ContextManager;
pub use tunnel::TunnelManager;

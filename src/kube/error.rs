//! Error taxonomy for context and tunnel management.
//!
//! Two enums cover the two stateful components:
//!
//! - [`ContextError`]: everything the context/connection manager can surface,
//!   from input validation (`EmptyIdentifier`, `SameName`) through credential
//!   file access, connectivity probing, and the persist-after-switch window.
//! - [`TunnelError`]: tunnel session lifecycle failures, including target
//!   resolution (`NoSelector`, `NoRunningInstances`) and session registry
//!   lookups (`SessionNotFound`).
//!
//! Every failure is local to the call that produced it; nothing here is fatal
//! to the process, and each error leaves the registries in a previously-valid
//! state. The one documented exception is [`ContextError::Persist`]: the
//! in-memory context switch has already happened when it is returned.
//!
//! # Transient classification
//!
//! [`is_transient_error`] decides whether a failed API call is worth retrying.
//! It feeds the `backon` gate on the connectivity probe:
//!
//! - **API errors with auth/not-found status codes (NOT retryable)**: 401,
//!   403, 404 and other definitive 4xx responses indicate problems that will
//!   not resolve by retrying.
//! - **API errors with congestion/server status codes (retryable)**: 408,
//!   429 and all 5xx responses are transient by nature.
//! - **Transport-level errors (retryable)**: connection refused, timeouts,
//!   TLS handshake failures and similar are treated as transient since they
//!   commonly resolve on retry.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the context and connection manager and its leaf dependencies.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The caller-supplied registry name was empty.
    #[error("context name must not be empty")]
    EmptyIdentifier,

    /// No kubeconfig path was given and no platform default could be found.
    #[error("no kubeconfig path given and no default location could be determined")]
    NoCredentialSource,

    /// The resolved kubeconfig path does not reference an existing file.
    #[error("kubeconfig file not found: {}", .0.display())]
    CredentialNotFound(PathBuf),

    /// The resolved kubeconfig path references a directory.
    #[error("kubeconfig path is a directory, not a file: {}", .0.display())]
    CredentialIsDirectory(PathBuf),

    /// The kubeconfig file exists but could not be read or parsed.
    #[error("failed to parse kubeconfig {}: {reason}", .path.display())]
    CredentialParse { path: PathBuf, reason: String },

    /// The kubeconfig file defines no contexts at all.
    #[error("kubeconfig {} defines no contexts", .0.display())]
    CredentialEmpty(PathBuf),

    /// A client could not be constructed from the kubeconfig.
    #[error("failed to build client for server {server}: {reason}")]
    ClientBuild { server: String, reason: String },

    /// The connectivity probe failed; nothing was registered.
    #[error("cluster {server} is unreachable: {reason}")]
    ConnectionUnreachable { server: String, reason: String },

    /// The name already identifies a registered entry.
    #[error("context already exists: {0}")]
    DuplicateContext(String),

    /// No registered entry matches the name.
    #[error("context not found: {0}")]
    ContextNotFound(String),

    /// Rename where old and new names are identical.
    #[error("old and new context names are the same: {0}")]
    SameName(String),

    /// The active registry key could not be matched back to a context name
    /// inside its source kubeconfig file.
    #[error("context {key} has no matching entry in kubeconfig {}", .path.display())]
    ContextNotFoundInCredential { key: String, path: PathBuf },

    /// Writing the current-context marker back to disk failed. The in-memory
    /// switch is NOT rolled back when this is returned: the registry already
    /// reflects the new active context while the file still names the old one.
    #[error("failed to persist current context to {}: {reason}", .path.display())]
    Persist { path: PathBuf, reason: String },

    /// The registry is empty; nothing has been loaded yet.
    #[error("no connections configured; load a kubeconfig first")]
    NoConnectionsConfigured,

    /// Entries exist but no client handle could be resolved for any of them.
    #[error("no client handles available")]
    NoClientsAvailable,
}

/// Errors from the tunnel session manager.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Resolving the active context failed before any tunnel work started.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The active context has no on-disk kubeconfig to build a transport from.
    #[error("active context {0} has no kubeconfig path on record")]
    KubeconfigPathMissing(String),

    /// The named target (pod or service) does not exist.
    #[error("{kind} {name} not found in namespace {namespace}")]
    TargetNotFound {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    /// The service declares no selector, so no pods can be resolved from it.
    #[error("service {0} has no selector")]
    NoSelector(String),

    /// The service selector matched no pods at all.
    #[error("no pods found for service {0}")]
    NoInstances(String),

    /// The service selector matched pods, but none are running.
    #[error("no running pods found for service {0}")]
    NoRunningInstances(String),

    /// Binding the local listener failed.
    #[error("failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The caller's timeout fired before the forwarding task reported ready.
    /// The partially-started tunnel has been torn down; no session was
    /// registered.
    #[error("tunnel start cancelled before the forwarding task became ready")]
    StartCancelled,

    /// No session with this id is registered (it may already be stopped).
    #[error("tunnel session not found: {0}")]
    SessionNotFound(u64),

    /// Any other Kubernetes API failure during target resolution.
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
}

/// Status codes that indicate a transient API-level failure.
fn is_transient_status(code: u16) -> bool {
    matches!(code, 408 | 429) || code >= 500
}

/// Determines if a failed API call is transient (retryable) or permanent.
///
/// API responses are classified by status code: auth and not-found responses
/// are permanent, congestion and server errors are transient. Anything that
/// never reached the API server (connect errors, timeouts, TLS failures) is
/// classified as transient, since those commonly resolve on retry.
pub(crate) fn is_transient_error(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(response) => is_transient_status(response.code),
        _ => true,
    }
}

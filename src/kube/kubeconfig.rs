//! Kubeconfig resolution, parsing, and current-context persistence.
//!
//! This module is the credential layer under the context manager:
//!
//! 1. **Resolution**: an optional caller-supplied path is resolved to an
//!    absolute file location with the usual fallback chain (explicit path,
//!    then `$KUBECONFIG`, then `~/.kube/config`) and validated to be an
//!    existing regular file before any parsing happens.
//!
//! 2. **Parsing**: the file is read once and every context it defines is
//!    extracted, not just the one marked current. A single kubeconfig may
//!    define many contexts; the manager registers all of them.
//!
//! 3. **Persistence**: [`write_current_context`] rewrites only the
//!    `current-context` field of the original file. The rewrite goes through
//!    a `serde_yaml::Value` round-trip so fields this module knows nothing
//!    about (extensions, auth plugins, future additions) survive untouched.
//!    YAML comments are not preserved; the YAML data model has no place for
//!    them.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::error::ContextError;

/// Environment variable pointing at a kubeconfig file
pub(crate) const KUBECONFIG_ENV_VAR: &str = "KUBECONFIG";

/// Namespace assumed when a context does not name one
pub(crate) const DEFAULT_NAMESPACE: &str = "default";

/// One context extracted from a kubeconfig file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedContext {
    /// Context name as written in the file (unprefixed)
    pub name: String,
    /// Cluster identifier the context references
    pub cluster: String,
    /// User identifier the context references
    pub user: String,
    /// Default namespace, falling back to "default"
    pub namespace: String,
    /// Server URL of the referenced cluster, if the cluster section defines one
    pub server: String,
    /// Whether the file's current-context marker names this context
    pub is_current: bool,
}

// Minimal mirror of the kubeconfig schema. Only the fields this module reads
// are modeled; everything else passes through the Value-based rewrite path.
#[derive(Debug, Deserialize)]
struct RawKubeconfig {
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,
    #[serde(default)]
    contexts: Vec<RawNamedContext>,
    #[serde(default)]
    clusters: Vec<RawNamedCluster>,
}

#[derive(Debug, Deserialize)]
struct RawNamedContext {
    name: String,
    #[serde(default)]
    context: Option<RawContext>,
}

#[derive(Debug, Deserialize)]
struct RawContext {
    #[serde(default)]
    cluster: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNamedCluster {
    name: String,
    #[serde(default)]
    cluster: Option<RawCluster>,
}

#[derive(Debug, Deserialize)]
struct RawCluster {
    #[serde(default)]
    server: Option<String>,
}

/// Resolve an optional kubeconfig path to a validated absolute location.
///
/// An empty `path` falls back to `$KUBECONFIG`, then to `~/.kube/config`.
/// The resolved path must reference an existing, non-directory file.
///
/// # Errors
///
/// * [`ContextError::NoCredentialSource`] - no path given and no default found
/// * [`ContextError::CredentialNotFound`] - the resolved path does not exist
/// * [`ContextError::CredentialIsDirectory`] - the resolved path is a directory
pub fn resolve_kubeconfig_path(path: &str) -> Result<PathBuf, ContextError> {
    let candidate = if !path.is_empty() {
        PathBuf::from(path)
    } else if let Ok(env_path) = env::var(KUBECONFIG_ENV_VAR)
        && !env_path.is_empty()
    {
        PathBuf::from(env_path)
    } else {
        dirs::home_dir()
            .ok_or(ContextError::NoCredentialSource)?
            .join(".kube")
            .join("config")
    };

    // Anchor relative paths to the current directory now; the path is kept
    // on the registered entry and re-checked long after the cwd may change.
    let candidate = std::path::absolute(&candidate)
        .map_err(|_| ContextError::CredentialNotFound(candidate.clone()))?;

    let metadata =
        fs::metadata(&candidate).map_err(|_| ContextError::CredentialNotFound(candidate.clone()))?;

    if metadata.is_dir() {
        return Err(ContextError::CredentialIsDirectory(candidate));
    }

    Ok(candidate)
}

/// Parse every context defined in a kubeconfig file.
///
/// Returns all contexts in file order, each annotated with whether the
/// file's `current-context` marker names it. Server URLs are joined in from
/// the clusters section; contexts referencing an unknown cluster get an
/// empty server string rather than failing the whole parse.
///
/// # Errors
///
/// * [`ContextError::CredentialParse`] - the file is unreadable or not valid YAML
/// * [`ContextError::CredentialEmpty`] - the file defines no contexts
pub fn parse_kubeconfig(path: &Path) -> Result<Vec<ParsedContext>, ContextError> {
    let content = fs::read_to_string(path).map_err(|e| ContextError::CredentialParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let raw: RawKubeconfig =
        serde_yaml::from_str(&content).map_err(|e| ContextError::CredentialParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if raw.contexts.is_empty() {
        return Err(ContextError::CredentialEmpty(path.to_path_buf()));
    }

    let current = raw.current_context.as_deref().unwrap_or_default();

    let contexts = raw
        .contexts
        .into_iter()
        .map(|named| {
            let ctx = named.context.unwrap_or(RawContext {
                cluster: None,
                user: None,
                namespace: None,
            });
            let cluster = ctx.cluster.unwrap_or_default();
            let server = raw
                .clusters
                .iter()
                .find(|c| c.name == cluster)
                .and_then(|c| c.cluster.as_ref())
                .and_then(|c| c.server.clone())
                .unwrap_or_default();

            ParsedContext {
                is_current: !current.is_empty() && named.name == current,
                name: named.name,
                cluster,
                user: ctx.user.unwrap_or_default(),
                namespace: ctx
                    .namespace
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                server,
            }
        })
        .collect();

    Ok(contexts)
}

/// Rewrite only the `current-context` field of a kubeconfig file in place.
///
/// All other fields survive the round-trip at YAML value level, including
/// sections this module does not model.
///
/// # Errors
///
/// * [`ContextError::Persist`] - the file could not be read, parsed, or written
pub fn write_current_context(path: &Path, context_name: &str) -> Result<(), ContextError> {
    let persist_err = |reason: String| ContextError::Persist {
        path: path.to_path_buf(),
        reason,
    };

    let content = fs::read_to_string(path).map_err(|e| persist_err(e.to_string()))?;

    let mut doc: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| persist_err(e.to_string()))?;

    let mapping = doc
        .as_mapping_mut()
        .ok_or_else(|| persist_err("kubeconfig root is not a mapping".to_string()))?;

    mapping.insert(
        serde_yaml::Value::String("current-context".to_string()),
        serde_yaml::Value::String(context_name.to_string()),
    );

    let rewritten = serde_yaml::to_string(&doc).map_err(|e| persist_err(e.to_string()))?;
    fs::write(path, rewritten).map_err(|e| persist_err(e.to_string()))?;

    Ok(())
}

//! Client construction and connectivity probing.
//!
//! This module builds the two client-handle flavors for an endpoint:
//!
//! 1. **Typed client**: a plain `kube::Client` used with schema-bound
//!    `Api<K>` handles by resource-CRUD collaborators.
//!
//! 2. **Dynamic client**: [`DynamicClient`], the schema-agnostic flavor:
//!    the same transport, handed out as `Api<DynamicObject>` for whatever
//!    `ApiResource` the caller discovered at runtime.
//!
//! Both are cheap to clone and safe for concurrent use once constructed;
//! nothing here mutates a client handle in place.
//!
//! # Connectivity probe
//!
//! Before a connection is trusted, [`KubeClientFactory`] runs a bounded,
//! low-cost read call (the `/version` endpoint) against the API server.
//! The probe retries with exponential backoff and jitter, but only for
//! transient failures:
//!
//! - **Retryable**: connect errors, timeouts, 408/429/5xx responses
//! - **Non-retryable**: 401/403/404 and other definitive API responses
//!
//! If every attempt fails, client construction fails and the caller
//! registers nothing, so a dead endpoint never pollutes the registry.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use kube::api::{Api, DynamicObject};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::{info, warn};

use super::config::{
    MAX_PROBE_RETRY_DELAY, resolve_probe_retries, resolve_probe_retry_delay, resolve_probe_timeout,
};
use super::error::{ContextError, is_transient_error};

/// Schema-agnostic client handle for a single endpoint.
///
/// Wraps the same transport as the typed client and hands out
/// `Api<DynamicObject>` scoped to an [`ApiResource`].
#[derive(Clone)]
pub struct DynamicClient {
    client: Client,
}

impl DynamicClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying transport, for callers that need raw access.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Dynamic API handle scoped to a namespace.
    pub fn namespaced(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }

    /// Dynamic API handle for cluster-scoped resources.
    pub fn cluster_scoped(&self, resource: &ApiResource) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), resource)
    }
}

/// Builds the typed/dynamic client pair for a kubeconfig file.
///
/// A trait so that tests can substitute a factory that skips the
/// connectivity probe; production code uses [`KubeClientFactory`].
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Build both client handles for `path`, bound to `context` (or the
    /// file's own default when `None`), and verify the endpoint is
    /// reachable before returning.
    async fn build(
        &self,
        path: &Path,
        context: Option<&str>,
        server: &str,
    ) -> Result<(Client, DynamicClient), ContextError>;
}

/// Production factory: builds clients from the kubeconfig file and probes
/// the endpoint before trusting the connection.
pub struct KubeClientFactory;

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn build(
        &self,
        path: &Path,
        context: Option<&str>,
        server: &str,
    ) -> Result<(Client, DynamicClient), ContextError> {
        let build_err = |reason: String| ContextError::ClientBuild {
            server: server.to_string(),
            reason,
        };

        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| build_err(e.to_string()))?;

        let options = KubeConfigOptions {
            context: context.map(String::from),
            cluster: None,
            user: None,
        };

        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| build_err(e.to_string()))?;

        let client = Client::try_from(config).map_err(|e| build_err(e.to_string()))?;

        probe_connectivity(&client, server).await?;

        Ok((client.clone(), DynamicClient::new(client)))
    }
}

/// Probe failure: either the call never completed, or the API answered badly.
#[derive(Debug)]
enum ProbeFailure {
    Timeout(Duration),
    Api(kube::Error),
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeFailure::Timeout(d) => write!(f, "probe timed out after {d:?}"),
            ProbeFailure::Api(e) => write!(f, "{e}"),
        }
    }
}

/// Run the connectivity probe against an endpoint, with bounded retry.
///
/// Issues a `/version` read under a timeout, retrying transient failures
/// with exponential backoff and jitter. A definitive API rejection fails
/// immediately.
pub(crate) async fn probe_connectivity(client: &Client, server: &str) -> Result<(), ContextError> {
    let timeout = resolve_probe_timeout();
    let max_retries = resolve_probe_retries();
    let min_delay = resolve_probe_retry_delay();

    let attempt_counter = AtomicU32::new(0);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(MAX_PROBE_RETRY_DELAY)
        .with_max_times(max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);

        if current_attempt > 0 {
            warn!(
                "Connectivity probe retry attempt {} against {}",
                current_attempt, server
            );
        }

        match tokio::time::timeout(timeout, client.apiserver_version()).await {
            Err(_) => Err(ProbeFailure::Timeout(timeout)),
            Ok(Err(e)) => Err(ProbeFailure::Api(e)),
            Ok(Ok(version)) => {
                info!(
                    "Endpoint {} reachable (server version {}.{})",
                    server, version.major, version.minor
                );
                Ok(())
            }
        }
    })
    .retry(backoff)
    .when(|e: &ProbeFailure| match e {
        ProbeFailure::Timeout(_) => true,
        ProbeFailure::Api(err) => is_transient_error(err),
    })
    .notify(|err, dur| {
        warn!("Connectivity probe failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    result.map_err(|e| ContextError::ConnectionUnreachable {
        server: server.to_string(),
        reason: e.to_string(),
    })
}

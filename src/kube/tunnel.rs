//! Concurrent tunnel session management.
//!
//! [`TunnelManager`] tracks every live port-forward tunnel in a concurrent
//! map keyed by a monotonically increasing session id. Ids are never
//! reused, even after sessions stop.
//!
//! # Lifecycle
//!
//! Starting a tunnel resolves the target pod through the active context,
//! then spawns a background task that binds the local listener and reports
//! the bound address back over a oneshot channel. The session is only
//! registered once that readiness signal arrives; the task in turn waits
//! for a registration acknowledgement before accepting connections, so the
//! task can never observe a stop request for a session that was not yet
//! inserted.
//!
//! # Teardown
//!
//! `DashMap::remove` is the single authoritative claim on a session: either
//! an explicit stop removes it and fires the cancellation token, or the
//! task removes its own entry when its accept loop exits. Exactly one side
//! wins, so double-stop and stop-after-crash both report `SessionNotFound`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::resolve_tunnel_ready_timeout;
use super::context::ContextManager;
use super::error::TunnelError;
use super::forward;
use super::types::{TargetKind, TunnelInfo};

/// Parameters for starting a tunnel.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    /// Namespace override; defaults to the active context's namespace
    pub namespace: Option<String>,
    /// Whether the target is a pod or a service
    pub target_kind: TargetKind,
    /// Name of the target pod or service
    pub target_name: String,
    /// Local port to bind on 127.0.0.1; `0` requests an ephemeral port
    pub local_port: u16,
    /// Port on the pod to forward to
    pub remote_port: u16,
}

struct TunnelSession {
    info: TunnelInfo,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Registry of live tunnel sessions.
pub struct TunnelManager {
    contexts: Arc<ContextManager>,
    sessions: Arc<DashMap<u64, TunnelSession>>,
    next_id: AtomicU64,
}

impl TunnelManager {
    pub fn new(contexts: Arc<ContextManager>) -> Self {
        Self {
            contexts,
            sessions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Start a tunnel to a pod or service in the active context.
    ///
    /// Service targets are resolved through the service's label selector to
    /// the first pod in `Running` phase. The returned info carries the port
    /// actually bound, which matters when an ephemeral port was requested.
    pub async fn start(&self, request: TunnelRequest) -> Result<TunnelInfo, TunnelError> {
        let entry = self.contexts.active_entry()?;
        if entry.source_path.is_empty() || !Path::new(&entry.source_path).exists() {
            return Err(TunnelError::KubeconfigPathMissing(entry.name));
        }

        let client = self.contexts.current_client()?;
        let namespace = request
            .namespace
            .clone()
            .unwrap_or_else(|| entry.namespace.clone());

        let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        let pod_name =
            resolve_target_pod(&client, &pods, &request, &namespace).await?;

        let id = self.allocate_id();
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<SocketAddr, TunnelError>>();
        let (ack_tx, ack_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(run_tunnel_task(
            id,
            pods,
            pod_name.clone(),
            request.local_port,
            request.remote_port,
            cancel.clone(),
            ready_tx,
            ack_rx,
            Arc::clone(&self.sessions),
        ));

        let bound = match tokio::time::timeout(resolve_tunnel_ready_timeout(), ready_rx).await {
            Ok(Ok(Ok(addr))) => addr,
            Ok(Ok(Err(e))) => {
                cancel.cancel();
                return Err(e);
            }
            Ok(Err(_)) | Err(_) => {
                warn!("Tunnel {} did not become ready in time", id);
                cancel.cancel();
                return Err(TunnelError::StartCancelled);
            }
        };

        let info = TunnelInfo {
            id,
            namespace,
            target_name: request.target_name,
            target_kind: request.target_kind,
            pod_name,
            local_port: bound.port(),
            remote_port: request.remote_port,
            started_at: Utc::now().to_rfc3339(),
        };

        self.sessions.insert(
            id,
            TunnelSession {
                info: info.clone(),
                cancel,
                task,
            },
        );
        // Release the task into its accept loop; it never self-removes
        // before this point, so the insert above cannot be lost.
        let _ = ack_tx.send(());

        info!(
            "Started tunnel {}: 127.0.0.1:{} -> {}/{}:{}",
            id, info.local_port, info.namespace, info.pod_name, info.remote_port
        );
        Ok(info)
    }

    /// Stop a tunnel, cancelling its background task.
    ///
    /// Removal from the map is the claim; a session already gone (stopped
    /// twice, or torn down by its own task) reports `SessionNotFound`.
    pub fn stop(&self, id: u64) -> Result<TunnelInfo, TunnelError> {
        match self.sessions.remove(&id) {
            Some((_, session)) => {
                session.cancel.cancel();
                info!("Stopped tunnel {}", id);
                Ok(session.info)
            }
            None => Err(TunnelError::SessionNotFound(id)),
        }
    }

    /// Snapshot of live sessions, ordered by id.
    pub fn list(&self) -> Vec<TunnelInfo> {
        let mut tunnels: Vec<TunnelInfo> =
            self.sessions.iter().map(|s| s.info.clone()).collect();
        tunnels.sort_by_key(|t| t.id);
        tunnels
    }

    /// Stop every session and wait for the tasks to finish.
    pub async fn shutdown(&self) {
        let keys: Vec<u64> = self.sessions.iter().map(|s| *s.key()).collect();
        let mut tasks = Vec::new();
        for id in keys {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.cancel.cancel();
                tasks.push(session.task);
            }
        }
        let count = tasks.len();
        futures::future::join_all(tasks).await;
        if count > 0 {
            info!("Shut down {} tunnel sessions", count);
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Background task for one session: bind, wait for registration, accept.
#[allow(clippy::too_many_arguments)]
async fn run_tunnel_task(
    id: u64,
    pods: Api<Pod>,
    pod_name: String,
    local_port: u16,
    remote_port: u16,
    cancel: CancellationToken,
    ready_tx: oneshot::Sender<Result<SocketAddr, TunnelError>>,
    ack_rx: oneshot::Receiver<()>,
    sessions: Arc<DashMap<u64, TunnelSession>>,
) {
    let listener = match forward::bind_local(local_port).await {
        Ok((listener, addr)) => {
            if ready_tx.send(Ok(addr)).is_err() {
                // Starter gave up; nothing was registered.
                return;
            }
            listener
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Wait until the session is actually in the map before serving, so the
    // self-removal below can never race ahead of the insert.
    tokio::select! {
        ack = ack_rx => {
            if ack.is_err() {
                return;
            }
        }
        _ = cancel.cancelled() => {
            return;
        }
    }

    forward::run_accept_loop(listener, pods, pod_name, remote_port, cancel).await;

    // Normal stop removed the entry first; this only fires when the loop
    // ended on its own (listener failure).
    if sessions.remove(&id).is_some() {
        debug!("Tunnel {} deregistered itself", id);
    }
}

/// Resolve the concrete pod a tunnel should attach to.
async fn resolve_target_pod(
    client: &Client,
    pods: &Api<Pod>,
    request: &TunnelRequest,
    namespace: &str,
) -> Result<String, TunnelError> {
    match request.target_kind {
        TargetKind::Pod => {
            match pods.get(&request.target_name).await {
                Ok(_) => Ok(request.target_name.clone()),
                Err(e) if is_not_found(&e) => Err(TunnelError::TargetNotFound {
                    kind: "pod",
                    name: request.target_name.clone(),
                    namespace: namespace.to_string(),
                }),
                Err(e) => Err(TunnelError::Api(e)),
            }
        }
        TargetKind::Service => {
            let services: Api<k8s_openapi::api::core::v1::Service> =
                Api::namespaced(client.clone(), namespace);
            let service = match services.get(&request.target_name).await {
                Ok(service) => service,
                Err(e) if is_not_found(&e) => {
                    return Err(TunnelError::TargetNotFound {
                        kind: "service",
                        name: request.target_name.clone(),
                        namespace: namespace.to_string(),
                    });
                }
                Err(e) => return Err(TunnelError::Api(e)),
            };

            let selector = service
                .spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| TunnelError::NoSelector(request.target_name.clone()))?;

            let params = ListParams::default().labels(&selector_string(selector));
            let matched = pods.list(&params).await?.items;
            if matched.is_empty() {
                return Err(TunnelError::NoInstances(request.target_name.clone()));
            }

            let running = pick_running_pod(&matched)
                .ok_or_else(|| TunnelError::NoRunningInstances(request.target_name.clone()))?;
            running
                .metadata
                .name
                .clone()
                .ok_or_else(|| TunnelError::NoRunningInstances(request.target_name.clone()))
        }
    }
}

/// First pod in `Running` phase, in list order.
fn pick_running_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter().find(|pod| {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            == Some("Running")
    })
}

/// Render a service selector as a label-selector query string.
fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http::{Request, Response};
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::client::Body;
    use serde_json::json;
    use tower_test::mock;

    use crate::kube::client::{ClientFactory, DynamicClient};
    use crate::kube::error::ContextError;

    type MockHandle = mock::Handle<Request<Body>, Response<Body>>;

    /// Client backed by an in-process mock service instead of a cluster.
    fn mock_client() -> (Client, MockHandle) {
        let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        (Client::new(service, "default"), handle)
    }

    /// Answer the next requests in order with canned JSON bodies.
    async fn serve(mut handle: MockHandle, responses: Vec<(u16, serde_json::Value)>) {
        for (status, body) in responses {
            let (_request, send) = handle.next_request().await.expect("no request arrived");
            send.send_response(
                Response::builder()
                    .status(status)
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            );
        }
    }

    fn not_found_body(kind: &str, name: &str) -> serde_json::Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("{kind} \"{name}\" not found"),
            "reason": "NotFound",
            "code": 404,
        })
    }

    fn service_body(name: &str, selector: Option<serde_json::Value>) -> serde_json::Value {
        let mut spec = json!({ "clusterIP": "10.96.0.10" });
        if let Some(selector) = selector {
            spec["selector"] = selector;
        }
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": name, "namespace": "default" },
            "spec": spec,
        })
    }

    fn pod_body(name: &str, phase: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "namespace": "default" },
            "status": { "phase": phase },
        })
    }

    fn pod_list_body(items: Vec<serde_json::Value>) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": {},
            "items": items,
        })
    }

    fn service_request(name: &str) -> TunnelRequest {
        TunnelRequest {
            namespace: None,
            target_kind: TargetKind::Service,
            target_name: name.to_string(),
            local_port: 0,
            remote_port: 80,
        }
    }

    fn pod_request(name: &str) -> TunnelRequest {
        TunnelRequest {
            namespace: None,
            target_kind: TargetKind::Pod,
            target_name: name.to_string(),
            local_port: 0,
            remote_port: 80,
        }
    }

    fn pod(name: &str, phase: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: phase.map(|p| PodStatus {
                phase: Some(p.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn empty_manager() -> TunnelManager {
        TunnelManager::new(Arc::new(ContextManager::new()))
    }

    mod session_registry {
        use super::*;

        #[tokio::test]
        async fn test_stop_missing_session_fails() {
            let manager = empty_manager();
            assert!(matches!(
                manager.stop(42),
                Err(TunnelError::SessionNotFound(42))
            ));
        }

        #[tokio::test]
        async fn test_list_is_empty_without_sessions() {
            let manager = empty_manager();
            assert!(manager.list().is_empty());
        }

        #[tokio::test]
        async fn test_ids_are_monotonic_and_never_reused() {
            let manager = empty_manager();
            let first = manager.allocate_id();
            let second = manager.allocate_id();
            let third = manager.allocate_id();
            assert_eq!(first, 1);
            assert_eq!(second, 2);
            assert_eq!(third, 3);
        }

        #[tokio::test]
        async fn test_start_without_contexts_fails() {
            let manager = empty_manager();
            let result = manager
                .start(TunnelRequest {
                    namespace: None,
                    target_kind: TargetKind::Pod,
                    target_name: "web".to_string(),
                    local_port: 0,
                    remote_port: 80,
                })
                .await;
            assert!(matches!(result, Err(TunnelError::Context(_))));
        }

        #[tokio::test]
        async fn test_shutdown_of_empty_manager_is_a_no_op() {
            let manager = empty_manager();
            manager.shutdown().await;
            assert!(manager.list().is_empty());
        }
    }

    mod target_resolution {
        use super::*;

        #[test]
        fn test_pick_running_pod_skips_other_phases() {
            let pods = vec![
                pod("pending", Some("Pending")),
                pod("done", Some("Succeeded")),
                pod("alive", Some("Running")),
                pod("alive-too", Some("Running")),
            ];
            let picked = pick_running_pod(&pods).unwrap();
            assert_eq!(picked.metadata.name.as_deref(), Some("alive"));
        }

        #[test]
        fn test_pick_running_pod_handles_missing_status() {
            let pods = vec![pod("no-status", None), pod("pending", Some("Pending"))];
            assert!(pick_running_pod(&pods).is_none());
        }

        #[test]
        fn test_selector_string_joins_sorted_labels() {
            let mut selector = BTreeMap::new();
            selector.insert("tier".to_string(), "backend".to_string());
            selector.insert("app".to_string(), "web".to_string());
            assert_eq!(selector_string(&selector), "app=web,tier=backend");
        }

        #[tokio::test]
        async fn test_missing_service_fails_target_not_found() {
            let (client, handle) = mock_client();
            let pods: Api<Pod> = Api::namespaced(client.clone(), "default");
            tokio::spawn(serve(handle, vec![(404, not_found_body("services", "web"))]));

            let result = resolve_target_pod(&client, &pods, &service_request("web"), "default").await;

            assert!(matches!(
                result,
                Err(TunnelError::TargetNotFound { kind: "service", .. })
            ));
        }

        #[tokio::test]
        async fn test_missing_pod_fails_target_not_found() {
            let (client, handle) = mock_client();
            let pods: Api<Pod> = Api::namespaced(client.clone(), "default");
            tokio::spawn(serve(handle, vec![(404, not_found_body("pods", "web-1"))]));

            let result = resolve_target_pod(&client, &pods, &pod_request("web-1"), "default").await;

            assert!(matches!(
                result,
                Err(TunnelError::TargetNotFound { kind: "pod", .. })
            ));
        }

        #[tokio::test]
        async fn test_service_without_selector_fails() {
            let (client, handle) = mock_client();
            let pods: Api<Pod> = Api::namespaced(client.clone(), "default");
            tokio::spawn(serve(handle, vec![(200, service_body("web", None))]));

            let result = resolve_target_pod(&client, &pods, &service_request("web"), "default").await;

            assert!(matches!(result, Err(TunnelError::NoSelector(name)) if name == "web"));
        }

        #[tokio::test]
        async fn test_selector_matching_no_pods_fails() {
            let (client, handle) = mock_client();
            let pods: Api<Pod> = Api::namespaced(client.clone(), "default");
            tokio::spawn(serve(
                handle,
                vec![
                    (200, service_body("web", Some(json!({ "app": "web" })))),
                    (200, pod_list_body(vec![])),
                ],
            ));

            let result = resolve_target_pod(&client, &pods, &service_request("web"), "default").await;

            assert!(matches!(result, Err(TunnelError::NoInstances(name)) if name == "web"));
        }

        #[tokio::test]
        async fn test_selector_with_no_running_pods_fails() {
            let (client, handle) = mock_client();
            let pods: Api<Pod> = Api::namespaced(client.clone(), "default");
            tokio::spawn(serve(
                handle,
                vec![
                    (200, service_body("web", Some(json!({ "app": "web" })))),
                    (
                        200,
                        pod_list_body(vec![
                            pod_body("web-1", "Pending"),
                            pod_body("web-2", "Succeeded"),
                        ]),
                    ),
                ],
            ));

            let result = resolve_target_pod(&client, &pods, &service_request("web"), "default").await;

            assert!(matches!(
                result,
                Err(TunnelError::NoRunningInstances(name)) if name == "web"
            ));
        }

        #[tokio::test]
        async fn test_service_resolves_first_running_pod() {
            let (client, handle) = mock_client();
            let pods: Api<Pod> = Api::namespaced(client.clone(), "default");
            tokio::spawn(serve(
                handle,
                vec![
                    (200, service_body("web", Some(json!({ "app": "web" })))),
                    (
                        200,
                        pod_list_body(vec![
                            pod_body("web-1", "Pending"),
                            pod_body("web-2", "Running"),
                            pod_body("web-3", "Running"),
                        ]),
                    ),
                ],
            ));

            let resolved =
                resolve_target_pod(&client, &pods, &service_request("web"), "default").await;

            assert_eq!(resolved.unwrap(), "web-2");
        }

        #[test]
        fn test_not_found_detection() {
            let err = kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            });
            assert!(is_not_found(&err));

            let err = kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            });
            assert!(!is_not_found(&err));
        }
    }

    mod start_lifecycle {
        use super::*;
        use std::io::Write;
        use std::path::Path;
        use tempfile::NamedTempFile;

        const FIXTURE_KUBECONFIG: &str = r#"apiVersion: v1
kind: Config
current-context: c1
clusters:
  - name: cluster-one
    cluster:
      server: https://10.0.0.1:6443
contexts:
  - name: c1
    context:
      cluster: cluster-one
      user: alice
      namespace: default
users:
  - name: alice
    user: {}
"#;

        /// Factory handing out a pre-built mock-backed client.
        struct MockFactory {
            client: Client,
        }

        #[async_trait]
        impl ClientFactory for MockFactory {
            async fn build(
                &self,
                _path: &Path,
                _context: Option<&str>,
                _server: &str,
            ) -> Result<(Client, DynamicClient), ContextError> {
                Ok((self.client.clone(), DynamicClient::new(self.client.clone())))
            }
        }

        async fn manager_with_mock(client: Client) -> (TunnelManager, NamedTempFile) {
            let mut file = NamedTempFile::new().unwrap();
            file.write_all(FIXTURE_KUBECONFIG.as_bytes()).unwrap();
            file.flush().unwrap();

            let contexts = Arc::new(ContextManager::with_factory(Box::new(MockFactory {
                client,
            })));
            contexts
                .load_kubeconfig("primary", file.path().to_str().unwrap())
                .await
                .unwrap();

            (TunnelManager::new(contexts), file)
        }

        #[tokio::test]
        async fn test_failed_service_start_registers_no_session() {
            let (client, handle) = mock_client();
            tokio::spawn(serve(handle, vec![(200, service_body("web", None))]));
            let (manager, _file) = manager_with_mock(client).await;

            let result = manager.start(service_request("web")).await;

            assert!(matches!(result, Err(TunnelError::NoSelector(_))));
            assert!(manager.list().is_empty());
        }

        #[tokio::test]
        async fn test_service_with_no_running_pods_registers_no_session() {
            let (client, handle) = mock_client();
            tokio::spawn(serve(
                handle,
                vec![
                    (200, service_body("web", Some(json!({ "app": "web" })))),
                    (200, pod_list_body(vec![pod_body("web-1", "Pending")])),
                ],
            ));
            let (manager, _file) = manager_with_mock(client).await;

            let result = manager.start(service_request("web")).await;

            assert!(matches!(result, Err(TunnelError::NoRunningInstances(_))));
            assert!(manager.list().is_empty());
        }

        #[tokio::test]
        async fn test_pod_start_list_stop_roundtrip() {
            let (client, handle) = mock_client();
            // One pod-existence check; port-forward streams only open per
            // accepted connection, so no further requests are made here.
            tokio::spawn(serve(handle, vec![(200, pod_body("web-1", "Running"))]));
            let (manager, _file) = manager_with_mock(client).await;

            let info = manager.start(pod_request("web-1")).await.unwrap();

            assert_eq!(info.id, 1);
            assert_eq!(info.pod_name, "web-1");
            assert_ne!(info.local_port, 0);
            assert_eq!(manager.list(), vec![info.clone()]);

            let stopped = manager.stop(info.id).unwrap();
            assert_eq!(stopped.id, info.id);
            assert!(manager.list().is_empty());

            assert!(matches!(
                manager.stop(info.id),
                Err(TunnelError::SessionNotFound(_))
            ));
        }
    }
}

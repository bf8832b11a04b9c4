//! Extras that only show up during tests.
#![allow(missing_docs)]
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use assert_json_diff::assert_json_include;
use futures::Future;
use http::{Request, Response, StatusCode};
use k8s_openapi::{DeepMerge, api::events::v1::Event};
use kube::{
    Resource, ResourceExt,
    client::{Body, Client},
    runtime::events::Recorder,
};
use serde_json::{Value, json};
use tower_test::mock::SendResponse;

use super::*;
use crate::config::Config;
use crate::context::{NamespacedName, ReconcileContext};
use crate::handler::{Handler, HandlerFuture, QueueOperations};
use api::v1alpha1::{ClusterStatus, SpiceDBCluster};
use updates::{Channel, EdgeSet, State, UpdateGraph};

pub use test_log::test;

impl Context {
    pub fn cluster_tests() -> (Arc<Self>, ClusterServerVerifier) {
        Self::cluster_tests_with(graph())
    }

    pub fn cluster_tests_with(graph: UpdateGraph) -> (Arc<Self>, ClusterServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let mock_recorder = Recorder::new(mock_client.clone(), REPORTER.clone());
        let ctx = Self {
            client: mock_client,
            recorder: mock_recorder,
            graph: Arc::new(graph),
            base_image: "ghcr.io/authzed/spicedb".into(),
        };
        (Arc::new(ctx), ClusterServerVerifier::new(handle))
    }
}

pub mod cluster {
    use crate::clusters::CLUSTER_FINALIZER;
    use api::v1alpha1::{ClusterSpec, ClusterStatus, SpiceDBCluster};
    use kube::ResourceExt;

    /// Return an empty SpiceDBCluster instance.
    pub fn test(spec: Option<ClusterSpec>) -> SpiceDBCluster {
        let mut c = SpiceDBCluster::new("test", spec.unwrap_or_default());
        c.meta_mut().namespace = Some("default".into());

        c
    }

    pub fn with_engine(engine: &str) -> SpiceDBCluster {
        let mut c = test(Some(ClusterSpec {
            datastore_engine: Some(engine.into()),
            ..Default::default()
        }));
        c.meta_mut().namespace = Some("test".into());
        c
    }

    pub fn finalized(mut c: SpiceDBCluster) -> SpiceDBCluster {
        c.finalizers_mut().push(CLUSTER_FINALIZER.into());
        c
    }

    pub fn ready() -> SpiceDBCluster {
        let spec = ClusterSpec {
            datastore_engine: Some("cockroachdb".into()),
            ..Default::default()
        };
        let mut c = finalized(test(spec.into()));
        c.metadata.uid = "42".to_string().into();

        c
    }

    pub fn with_status(mut c: SpiceDBCluster, status: ClusterStatus) -> SpiceDBCluster {
        c.status = Some(status);
        c
    }
}

/// Graph with a two-node cockroachdb channel.
pub fn graph() -> UpdateGraph {
    UpdateGraph {
        channels: vec![Channel {
            name: "cockroachdb".into(),
            metadata: BTreeMap::from([("datastore".to_string(), "cockroachdb".to_string())]),
            edges: EdgeSet::from([("v1.0.0".to_string(), vec!["v1.0.1".to_string()])]),
            nodes: vec![
                State {
                    id: "v1.0.1".into(),
                    ..Default::default()
                },
                State {
                    id: "v1.0.0".into(),
                    ..Default::default()
                },
            ],
        }],
    }
}

/// Graph with a fan-out and migrations, mirroring the published shape.
pub fn fanout_graph() -> UpdateGraph {
    UpdateGraph {
        channels: vec![Channel {
            name: "cockroachdb".into(),
            metadata: BTreeMap::from([("datastore".to_string(), "cockroachdb".to_string())]),
            edges: EdgeSet::from([
                (
                    "v1.0.0".to_string(),
                    vec!["v1.0.1".to_string(), "v1.0.2".to_string()],
                ),
                ("v1.0.1".to_string(), vec!["v1.0.2".to_string()]),
                ("v1.0.2".to_string(), vec!["v1.0.3".to_string()]),
            ]),
            nodes: vec![
                State {
                    id: "v1.0.3".into(),
                    migration: "b".into(),
                    ..Default::default()
                },
                State {
                    id: "v1.0.2".into(),
                    migration: "a".into(),
                    ..Default::default()
                },
                State {
                    id: "v1.0.1".into(),
                    ..Default::default()
                },
                State {
                    id: "v1.0.0".into(),
                    ..Default::default()
                },
            ],
        }],
    }
}

/// Effective configuration for the canonical test cluster.
pub fn config() -> Config {
    Config {
        namespace: "test".into(),
        name: "test".into(),
        image: "ghcr.io/authzed/spicedb:v1.0.1".into(),
        ..Default::default()
    }
}

pub fn context(queue: Arc<FakeQueue>) -> ReconcileContext {
    context_for(queue, cluster::with_engine("cockroachdb"))
}

pub fn context_for(queue: Arc<FakeQueue>, cluster: SpiceDBCluster) -> ReconcileContext {
    let nn = NamespacedName::new(
        cluster.namespace().unwrap_or_else(|| "test".into()),
        cluster.name_any(),
    );
    ReconcileContext::new(nn, Arc::new(cluster), queue)
}

pub fn context_with_status(queue: Arc<FakeQueue>, status: ClusterStatus) -> ReconcileContext {
    context_for(
        queue,
        cluster::with_status(cluster::with_engine("cockroachdb"), status),
    )
}

pub fn not_found_error() -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".into(),
        message: r#"configmaps "config" not found"#.into(),
        reason: "NotFound".into(),
        code: 404,
    })
}

pub fn api_error(message: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".into(),
        message: message.into(),
        reason: "InternalError".into(),
        code: 500,
    })
}

/// FakeQueue records deferral requests for later assertions.
#[derive(Default)]
pub struct FakeQueue {
    requeues: AtomicUsize,
    errs: Mutex<Vec<Error>>,
    api_errs: Mutex<Vec<Error>>,
}

impl FakeQueue {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn requeue_calls(&self) -> usize {
        self.requeues.load(Ordering::SeqCst)
    }

    pub fn err_calls(&self) -> usize {
        self.errs.lock().unwrap().len()
    }

    pub fn api_err_calls(&self) -> usize {
        self.api_errs.lock().unwrap().len()
    }

    pub fn assert_untouched(&self) {
        assert_eq!(self.requeue_calls(), 0, "unexpected requeue");
        assert_eq!(self.err_calls(), 0, "unexpected requeue_err");
        assert_eq!(self.api_err_calls(), 0, "unexpected requeue_api_err");
    }
}

impl QueueOperations for FakeQueue {
    fn requeue(&self) {
        self.requeues.fetch_add(1, Ordering::SeqCst);
    }

    fn requeue_err(&self, err: Error) {
        self.errs.lock().unwrap().push(err);
    }

    fn requeue_api_err(&self, err: Error) {
        self.api_errs.lock().unwrap().push(err);
    }
}

/// CaptureNext counts invocations and snapshots what the context held when
/// the stage under test handed over.
#[derive(Default)]
pub struct CaptureNext {
    calls: AtomicUsize,
    config_map: Mutex<Option<k8s_openapi::api::core::v1::ConfigMap>>,
    config: Mutex<Option<Config>>,
}

impl CaptureNext {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_config_map(&self) -> Option<k8s_openapi::api::core::v1::ConfigMap> {
        self.config_map.lock().unwrap().clone()
    }

    pub fn seen_config(&self) -> Option<Config> {
        self.config.lock().unwrap().clone()
    }
}

impl Handler for CaptureNext {
    fn handle<'c>(&'c self, ctx: &'c mut ReconcileContext) -> HandlerFuture<'c> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.config_map.lock().unwrap() = ctx.schema_config_map().cloned();
        *self.config.lock().unwrap() = ctx.config().cloned();
        Box::pin(async {})
    }
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

// We wrap tower_test::mock::Handle
type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

pub struct ClusterServerVerifier {
    handle: ApiServerHandle,
    state: BTreeMap<String, Value>,
}

/// Scenarios we want to test for
pub enum ClusterScenario {
    /// A bare cluster gets the finalizer added.
    FinalizerCreation(SpiceDBCluster),
    /// Target selection fails; a Warning event and a condition are recorded.
    ValidationFailed(SpiceDBCluster),
    /// The full apply path: workload applies and status patches.
    Ready(SpiceDBCluster),
}

impl ClusterServerVerifier {
    fn new(handle: ApiServerHandle) -> Self {
        Self {
            handle,
            state: BTreeMap::new(),
        }
    }

    #[inline]
    fn next_request(
        &mut self,
    ) -> impl Future<Output = Option<(Request<Body>, SendResponse<Response<Body>>)>> {
        self.handle.next_request()
    }

    /// Tests only get to run specific scenarios that have matching handlers.
    ///
    /// NB: If the controller is making more calls than we are handling in the
    /// scenario, you then typically see a `KubeError(Service(Closed(())))`
    /// from the reconciler.
    ///
    /// You should await the `JoinHandle` (with a timeout) from this function
    /// to ensure that the scenario runs to completion (i.e. all expected
    /// calls were responded to), using the timeout to catch missing api calls
    /// to Kubernetes.
    pub fn run(self, scenario: ClusterScenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            use ClusterScenario::*;
            // moving self => one scenario per test
            match scenario {
                FinalizerCreation(c) => self.handle_finalizer_creation(c).await,
                ValidationFailed(c) => {
                    let mut c = c;
                    self.handle_event(Event {
                        type_: Some("Warning".into()),
                        reason: Some("ValidatingFailed".into()),
                        action: Some("Reconcile".into()),
                        ..Default::default()
                    })
                    .await
                    .unwrap()
                    .handle_status_patch(&mut c)
                    .await
                }
                Ready(c) => self.handle_ready(c).await,
            }
            .expect("scenario completed without errors");
        })
    }

    async fn handle_finalizer_creation(mut self, c: SpiceDBCluster) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        // We expect a json patch to the specified document adding our finalizer
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/authzed.com/v1alpha1/namespaces/default/spicedbclusters/{}?",
                c.name_any()
            )
        );
        let expected_patch = serde_json::json!([
            { "op": "test", "path": "/metadata/finalizers", "value": null },
            { "op": "add", "path": "/metadata/finalizers", "value": vec![crate::clusters::CLUSTER_FINALIZER] }
        ]);
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let runtime_patch: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid document from runtime");
        assert_json_include!(actual: runtime_patch, expected: expected_patch);

        let c = cluster::finalized(c);
        let response = serde_json::to_vec(&c).unwrap(); // respond as the apiserver would have
        send.send_response(Response::builder().body(Body::from(response)).unwrap());

        Ok(self)
    }

    /// Tests that the next request is an Event matching "ev".
    ///
    /// Echoes back the sent event.
    async fn handle_event(mut self, ev: Event) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert!(
            matches!(*request.method(), http::Method::POST | http::Method::PATCH),
            "unexpected method"
        );
        assert!(
            uri.starts_with("/apis/events.k8s.io/v1/namespaces/default/events"),
            "unexpected path"
        );

        let req_body = request.into_body().collect_bytes().await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&req_body).expect("event object is json");
        let event: Event = serde_json::from_value(json).expect("valid event");

        assert_eq!(event.type_, ev.type_, "unexpected \"type\"");
        assert_eq!(event.reason, ev.reason, "unexpected \"reason\"");
        assert_eq!(event.action, ev.action, "unexpected \"action\"");

        let response = serde_json::to_vec(&event).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());

        Ok(self)
    }

    async fn handle_ready(mut self, mut c: SpiceDBCluster) -> Result<Self> {
        use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};

        self = self
            .handle_apply::<Deployment, _>(&c, "test")
            .await?
            .handle_apply::<Service, _>(&c, "test")
            .await?
            // Applied version recorded:
            .handle_status_patch(&mut c)
            .await?
            // Terminal condition recorded:
            .handle_status_patch(&mut c)
            .await?;

        Ok(self)
    }

    /// Handles a server-side apply PATCH for a resource of type `R`.
    async fn handle_apply<R, S>(mut self, _c: &SpiceDBCluster, name: S) -> Result<Self>
    where
        R: Resource<DynamicType = ()>,
        S: AsRef<str>,
    {
        let name = name.as_ref();
        let (request, send) = self.next_request().await.expect("service not called");
        let uri = request.uri().to_string();
        eprintln!("{}\t{}", request.method(), &uri);
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        // Need these asserts because core types use `/api/` and everything else uses `/apis/`.
        assert!(uri.starts_with("/api"), "unexpected path");
        let key = format!(
            "/{}/namespaces/default/{}/{}",
            R::api_version(&()),
            R::plural(&()),
            name,
        );
        let pat = format!(
            "{}?&fieldManager={}&fieldValidation=Strict",
            key,
            crate::CONTROLLER_NAME,
        );
        assert!(uri.ends_with(&pat), "unexpected path: {uri}");

        let req_body = request.into_body().collect_bytes().await.unwrap();
        let obj: serde_json::Value = serde_json::from_slice(&req_body).expect("object is json");
        let objname = obj
            .get("metadata")
            .expect("object has metadata")
            .get("name")
            .expect("metadata has name")
            .as_str()
            .expect("name is a string");
        assert_eq!(name, objname, "patch to wrong resource?");

        let obj = self
            .state
            .entry(key)
            .and_modify(|v| merge(v, obj.clone()))
            .or_insert(obj);
        let response = Response::builder()
            .body(Body::from(serde_json::to_vec(obj).unwrap()))
            .unwrap();
        send.send_response(response);

        Ok(self)
    }

    async fn handle_status_patch(mut self, c: &mut SpiceDBCluster) -> Result<Self> {
        let (request, send) = self.next_request().await.expect("service not called");
        eprintln!("{}\t{}", request.method(), request.uri());
        assert_eq!(request.method(), http::Method::PATCH, "unexpected method");
        assert_eq!(
            request.uri().to_string(),
            format!(
                "/apis/{}/namespaces/default/{}/{}/status?&fieldManager={}&fieldValidation=Strict",
                SpiceDBCluster::api_version(&()),
                SpiceDBCluster::plural(&()),
                c.name_any(),
                crate::CONTROLLER_NAME,
            ),
            "unexpected path",
        );

        let req_body = request.into_body().collect_bytes().await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&req_body).expect("patch_status object is json");
        let status_json = json.get("status").expect("status object").clone();
        let status: ClusterStatus = serde_json::from_value(status_json).expect("valid status");
        c.status.merge_from(status.into());
        let response = serde_json::to_vec(c).unwrap();
        // pass through document "patch accepted"
        send.send_response(Response::builder().body(Body::from(response)).unwrap());

        Ok(self)
    }
}

// Folds an apply body into the verifier's object store. Objects merge
// key-by-key, null removes, anything else replaces; nowhere near real
// server-side apply, but close enough to echo plausible responses.
fn merge(a: &mut Value, b: Value) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                if v.is_null() {
                    a.remove(&k);
                } else {
                    merge(a.entry(k).or_insert(Value::Null), v);
                }
            }
        }
        (a, b) => *a = b,
    }
}

#[allow(dead_code)]
fn not_found<R: Resource<DynamicType = ()>, S: ToString>(name: S) -> Response<Body> {
    let err = json!({
        "code": 404,
        "status": "Failure",
        "reason": "NotFound",
        "details": {
            "group": R::group(&()),
            "kind": R::kind(&()),
            "name": name.to_string(),
        },
    });
    let response = serde_json::to_vec(&err).unwrap();
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from(response))
        .unwrap()
}

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Controller implements common functionality for the controller binary and
//! the SpiceDBCluster reconciler itself.

use std::{env, pin::Pin, sync::Arc, sync::LazyLock};

use futures::Future;
use k8s_openapi::{apimachinery::pkg::apis::meta, jiff::Timestamp};
use kube::runtime::events;
use tracing::warn;

use updates::UpdateGraph;

/// Prelude is the common types for the CRD controller.
pub(crate) mod prelude {
    pub use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

    pub use futures::prelude::*;
    pub use k8s_openapi::{
        api::*,
        apimachinery::pkg::apis::meta::{self, v1::Condition},
    };
    pub use kube::{
        self,
        api::{Api, Patch, PatchParams, PostParams},
        runtime::{
            controller::{Action, Controller},
            events::{Event, EventType, Recorder, Reporter},
            watcher,
        },
        Resource, ResourceExt,
    };
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use api::v1alpha1;

    pub use super::{now, spicedb_condition, spicedb_label};
    pub use super::{Context, ControllerFuture, Error, Result};
    pub use super::{CONTROLLER_NAME, CREATE_PARAMS, PATCH_PARAMS};
}

pub mod adoption;
pub mod apply_schema;
pub mod clusters;
pub mod config;
pub mod context;
pub mod deploy;
pub mod handler;
pub mod schema_client;

#[cfg(test)]
pub(crate) mod testing;

// NB The docs are unclear, but backtraces are unsupported on stable.
/// Error is everything that can go wrong in the controller process.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// TracingConfig indicates the error came from the tracing setup.
    #[error("tracing_subscriber error: {0}")]
    TracingConfig(#[from] tracing_subscriber::filter::ParseError),
    /// Tracing indicates the error came from installing the tracing subscriber.
    #[error("tracing error: {0}")]
    Tracing(#[from] tracing::subscriber::SetGlobalDefaultError),
    /// Kube is a generic error from the `kube` crate.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig indicates the process was unable to find a kubeconfig.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::InferConfigError),
    /// Io indicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON indicates a JSON serialization failed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// AddrParse indicates the provided string failed to parse into an address.
    #[error("parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    /// Tokio indicates an error starting tasks.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
    /// Updates indicates an update-graph load or query failed.
    #[error("update graph error: {0}")]
    Updates(#[from] updates::Error),
    /// Transport indicates the management RPC channel could not be opened.
    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    /// Grpc carries a status returned by the management RPC.
    #[error("grpc error: {0}")]
    Grpc(#[from] tonic::Status),
    /// Finalizer indicates the finalizer machinery failed.
    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// Other is a catch-all error.
    #[error("some other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result typedef for the controller.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Context is common context for the controller.
pub struct Context {
    /// Client is a k8s client. This should only ever be `clone()`'d out of
    /// the Context.
    pub client: kube::Client,
    /// Recorder publishes kubernetes Events attributed to this controller.
    pub recorder: events::Recorder,
    /// Graph is the update graph loaded at startup, immutable for the life of
    /// the process.
    pub graph: Arc<UpdateGraph>,
    /// Base_image is the fallback container repository to resolve tags
    /// against.
    pub base_image: String,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ctx")
    }
}

impl Context {
    /// Publish publishes a kubernetes Event, logging instead of failing when
    /// the API refuses it.
    pub async fn publish(
        &self,
        ev: events::Event,
        oref: &k8s_openapi::api::core::v1::ObjectReference,
    ) {
        if let Err(err) = self.recorder.publish(&ev, oref).await {
            warn!(error = %err, "unable to publish event");
        }
    }
}

/// ControllerFuture is the type the controller constructors should return.
pub type ControllerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// REPORTER identifies this controller in published Events.
pub static REPORTER: LazyLock<events::Reporter> = LazyLock::new(|| events::Reporter {
    controller: CONTROLLER_NAME.to_string(),
    instance: env::var("CONTROLLER_POD_NAME").ok(),
});

/// Now reports the current time in the form status conditions carry.
pub fn now() -> meta::v1::Time {
    meta::v1::Time(Timestamp::now())
}

/// Condition is like [keyify], but does not force lower-case.
fn condition<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c,
        })
        .for_each(|c| out.push(c));
    out
}

/// Keyify sanitizes the key for use in k8s metadata.
fn keyify<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c.to_ascii_lowercase(),
        })
        .for_each(|c| out.push(c));
    out
}

/// Spicedb_condition returns the provided argument as a name in the
/// operator's space, suitable for use as a condition type.
pub fn spicedb_condition<S: AsRef<str>>(s: S) -> String {
    condition("authzed.com/", s)
}

/// Spicedb_label returns the provided argument as a name in the operator's
/// space, suitable for use as an annotation or label.
pub fn spicedb_label<S: AsRef<str>>(s: S) -> String {
    keyify("authzed.com/", s)
}

/// K8s_label returns the provided argument as a name in the
/// "app.kubernetes.io" space, suitable for use as an annotation or label.
pub fn k8s_label<S: AsRef<str>>(s: S) -> String {
    keyify("app.kubernetes.io/", s)
}

/// Owner_annotation is the annotation key marking a ConfigMap as owned by the
/// named cluster.
pub fn owner_annotation<S: AsRef<str>>(cluster_name: S) -> String {
    format!("{OWNER_ANNOTATION_PREFIX}{}", cluster_name.as_ref())
}

/// Owner_field_manager is the field manager used for ownership applies on
/// adopted objects.
pub fn owner_field_manager<S: AsRef<str>, T: AsRef<str>>(namespace: S, name: T) -> String {
    format!(
        "spicedbcluster-owner-{}-{}",
        namespace.as_ref(),
        name.as_ref()
    )
}

// Tricks to create the DEFAULT_BASE_IMAGE value:
const DEFAULT_CONTAINER_REPOSITORY: &str = "ghcr.io/authzed/spicedb";

/// DEFAULT_BASE_IMAGE is the container repository graph-resolved tags are
/// appended to when not specified in a CRD.
///
/// The repository can be changed by providing the environment variable
/// `CONTAINER_REPOSITORY` at compile-time.
pub static DEFAULT_BASE_IMAGE: LazyLock<String> = LazyLock::new(|| {
    option_env!("CONTAINER_REPOSITORY")
        .unwrap_or(DEFAULT_CONTAINER_REPOSITORY)
        .to_string()
});

/// MANAGED_LABEL_KEY marks objects the operator manages.
pub const MANAGED_LABEL_KEY: &str = "authzed.com/managed-by";
/// MANAGED_LABEL_VALUE is the value of [MANAGED_LABEL_KEY].
pub const MANAGED_LABEL_VALUE: &str = "operator";
/// OWNER_ANNOTATION_PREFIX prefixes the owning cluster's name in ownership
/// annotations.
pub const OWNER_ANNOTATION_PREFIX: &str = "authzed.com/cluster-";
/// OWNED_ANNOTATION_VALUE is the value ownership annotations carry.
pub const OWNED_ANNOTATION_VALUE: &str = "owned";
/// SCHEMA_KEY is the ConfigMap key holding the policy schema.
pub const SCHEMA_KEY: &str = "schema";
/// PRESHARED_KEY_KEY is the Secret key holding the preshared key.
pub const PRESHARED_KEY_KEY: &str = "preshared_key";
/// SPICEDB_GRPC_PORT is the port the managed service's gRPC API listens on.
pub const SPICEDB_GRPC_PORT: u16 = 50051;
/// EVENT_CONFIGMAP_ADOPTED is emitted when a ConfigMap is adopted for a
/// cluster.
pub const EVENT_CONFIGMAP_ADOPTED: &str = "ConfigMapAdoptedBySpiceDB";

/// COMPONENT_LABEL is the well-known "component" label.
pub static COMPONENT_LABEL: LazyLock<String> = LazyLock::new(|| k8s_label("component"));
/// INSTANCE_LABEL is the well-known "instance" label.
pub static INSTANCE_LABEL: LazyLock<String> = LazyLock::new(|| k8s_label("instance"));

/// CREATE_PARAMS is default post parameters.
pub static CREATE_PARAMS: LazyLock<kube::api::PostParams> =
    LazyLock::new(|| kube::api::PostParams {
        dry_run: false,
        field_manager: Some(String::from(CONTROLLER_NAME)),
    });
/// PATCH_PARAMS is default patch parameters.
pub static PATCH_PARAMS: LazyLock<kube::api::PatchParams> =
    LazyLock::new(|| kube::api::PatchParams::apply(CONTROLLER_NAME));

/// CONTROLLER_NAME is the name the controller uses whenever it needs a
/// human-readable name.
pub const CONTROLLER_NAME: &str = "spicedb-operator";

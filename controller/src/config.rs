//! Config assembles the effective configuration one reconcile works from:
//! resolved target version and image, schema source, and the credentials for
//! the management RPC.

use std::sync::Arc;

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use tracing::{debug, warn};

use api::v1alpha1::{SpiceDBCluster, SpiceDBVersion};
use updates::UpdateGraph;

use crate::context::{NamespacedName, ReconcileContext};
use crate::handler::{Handler, HandlerFuture};
use crate::{PRESHARED_KEY_KEY, SCHEMA_KEY, spicedb_condition};

/// MIGRATING_CONDITION marks a cluster that is mid-rollout; target selection
/// pins to the current version until it clears.
pub fn migrating_condition() -> String {
    spicedb_condition("Migrating")
}

/// Config is the effective configuration for one reconcile pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    /// Namespace the workload runs in.
    pub namespace: String,
    /// Name of the cluster, its Deployment, and its Service.
    pub name: String,
    /// Image is the fully resolved container image reference.
    pub image: String,
    /// Target is the version selected by the update graph, absent when the
    /// image was pinned by tag.
    pub target: Option<SpiceDBVersion>,
    /// Available enumerates the other safe destinations from the target.
    pub available: Vec<SpiceDBVersion>,
    /// Schema is the policy schema text, empty when none is configured.
    pub schema: String,
    /// Preshared_key authenticates management RPC calls.
    pub preshared_key: String,
}

impl Config {
    /// Build resolves the cluster's target against `graph` and folds in the
    /// adopted schema source and preshared key.
    pub fn build(
        cluster: &SpiceDBCluster,
        graph: &UpdateGraph,
        default_base_image: &str,
        schema_config_map: Option<&ConfigMap>,
        preshared_key: String,
    ) -> Result<Self, updates::Error> {
        let spec = &cluster.spec;
        let status = cluster.status.clone().unwrap_or_default();
        let rolling = status.has_condition(migrating_condition());

        let (base, target, state) = graph.compute_target(
            spec.base_image.as_deref().unwrap_or(default_base_image),
            spec.image.as_deref().unwrap_or_default(),
            spec.version.as_deref().unwrap_or_default(),
            spec.channel.as_deref().unwrap_or_default(),
            spec.datastore_engine.as_deref().unwrap_or_default(),
            status.current_version.as_ref(),
            rolling,
        )?;
        let tag = if state.tag.is_empty() {
            &state.id
        } else {
            &state.tag
        };
        let available = match &target {
            Some(target) => graph.available_versions(
                spec.datastore_engine.as_deref().unwrap_or_default(),
                target,
            )?,
            None => Vec::new(),
        };

        let schema = schema_config_map
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(SCHEMA_KEY))
            .cloned()
            .unwrap_or_default();

        Ok(Self {
            namespace: cluster.namespace().unwrap_or_default(),
            name: cluster.name_any(),
            image: format!("{base}:{tag}"),
            target,
            available,
            schema,
            preshared_key,
        })
    }
}

/// SecretFetchFn reads the preshared-key Secret.
pub type SecretFetchFn = Box<
    dyn Fn(&NamespacedName) -> BoxFuture<'static, Result<Option<Secret>, kube::Error>>
        + Send
        + Sync,
>;

/// InvalidConfigHook surfaces a graph validation failure; the pipeline halts
/// afterwards without requeuing.
pub type InvalidConfigHook = Box<
    dyn Fn(&ReconcileContext, &updates::Error) -> BoxFuture<'static, ()> + Send + Sync,
>;

/// ConfigHandler assembles the effective [Config] and publishes it into the
/// context for the stages after it.
pub struct ConfigHandler {
    graph: Arc<UpdateGraph>,
    default_base_image: String,
    get_secret: SecretFetchFn,
    invalid_config: InvalidConfigHook,
    next: Arc<dyn Handler>,
}

impl ConfigHandler {
    /// New assembles the handler.
    pub fn new(
        graph: Arc<UpdateGraph>,
        default_base_image: String,
        get_secret: SecretFetchFn,
        invalid_config: InvalidConfigHook,
        next: Arc<dyn Handler>,
    ) -> Self {
        Self {
            graph,
            default_base_image,
            get_secret,
            invalid_config,
            next,
        }
    }
}

impl Handler for ConfigHandler {
    fn handle<'c>(&'c self, ctx: &'c mut ReconcileContext) -> HandlerFuture<'c> {
        Box::pin(async move {
            let preshared_key = match ctx.cluster().spec.secret_name.clone() {
                None => String::new(),
                Some(name) => {
                    let nn = NamespacedName::new(&ctx.cluster_nn().namespace, name);
                    match (self.get_secret)(&nn).await {
                        Ok(Some(secret)) => secret
                            .data
                            .as_ref()
                            .and_then(|data| data.get(PRESHARED_KEY_KEY))
                            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                            .unwrap_or_default(),
                        Ok(None) => {
                            warn!(%nn, "preshared-key Secret not found");
                            String::new()
                        }
                        Err(err) => return ctx.queue().requeue_api_err(err.into()),
                    }
                }
            };

            let config = match Config::build(
                ctx.cluster(),
                &self.graph,
                &self.default_base_image,
                ctx.schema_config_map(),
                preshared_key,
            ) {
                Ok(config) => config,
                Err(err) => {
                    // User-authored spec problem; a requeue cannot fix it.
                    warn!(error = %err, "unable to compute a target version");
                    return (self.invalid_config)(ctx, &err).await;
                }
            };

            debug!(image = config.image, target = ?config.target, "assembled effective configuration");
            ctx.set_config(config);
            self.next.handle(ctx).await
        })
    }
}

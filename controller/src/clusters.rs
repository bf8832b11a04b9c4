//! Clusters holds the controller for the "SpiceDBCluster" CRD.

use std::sync::{Arc, LazyLock};

use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::ListParams,
    core::GroupVersionKind,
    runtime::{
        controller::Error as CtrlErr,
        finalizer::{Event as Finalizer, finalizer},
    },
};
use serde_json::json;
use tokio::{
    signal::unix::{SignalKind, signal},
    time::Duration,
};
use tokio_stream::wrappers::SignalStream;
use tracing::*;

use crate::{
    EVENT_CONFIGMAP_ADOPTED,
    adoption::{AdoptedHook, ConfigMapAdoptionHandler, KubeConfigMapAccess, MissingHook},
    apply_schema::{DialFn, InvalidSchemaHook, PatchStatusFn, SchemaApplyHandler, SchemaConnection},
    config::{ConfigHandler, InvalidConfigHook, SecretFetchFn},
    context::{NamespacedName, ReconcileContext},
    deploy::DeployHandler,
    handler::{Handler, HandlerFuture, RequeueSink, Terminal},
    prelude::*,
    schema_client::{self, SchemaServiceClient},
};
use api::v1alpha1::SpiceDBCluster;

pub(crate) static CLUSTER_FINALIZER: &str = "spicedbclusters.authzed.com";
static SELF_GVK: LazyLock<GroupVersionKind> = LazyLock::new(|| GroupVersionKind {
    group: SpiceDBCluster::group(&()).to_string(),
    version: SpiceDBCluster::version(&()).to_string(),
    kind: SpiceDBCluster::kind(&()).to_string(),
});
static DEFAULT_REQUEUE: LazyLock<Action> =
    LazyLock::new(|| Action::requeue(Duration::from_secs(60 * 60)));

fn validating_failed_condition() -> String {
    spicedb_condition("ValidatingFailed")
}

fn schema_write_failed_condition() -> String {
    spicedb_condition("SchemaWriteFailed")
}

fn reconciled_condition() -> String {
    spicedb_condition("Reconciled")
}

fn new_condition<M: ToString>(
    type_: String,
    reason: &str,
    message: M,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_,
        status: "True".into(),
        reason: reason.into(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: now(),
    }
}

/// Controller is the SpiceDBCluster controller.
///
/// An error is returned if any setup fails.
#[instrument(skip_all)]
pub fn controller(cancel: CancellationToken, ctx: Arc<Context>) -> Result<ControllerFuture> {
    let client = ctx.client.clone();
    let ctlcfg = watcher::Config::default();
    let root: Api<SpiceDBCluster> = Api::all(client.clone());
    let sig = SignalStream::new(signal(SignalKind::user_defined1())?);

    Ok(async move {
        if let Err(e) = root.list(&ListParams::default().limit(1)).await {
            error!("CRD ({SELF_GVK:?}) is not queryable ({e:?}); is the CRD installed?");
            return Err(Error::Other(anyhow::anyhow!("no CRD")));
        }

        let ctl = Controller::new(root, ctlcfg.clone())
            .owns(
                Api::<core::v1::ConfigMap>::all(client.clone()),
                ctlcfg.clone(),
            )
            .owns(Api::<core::v1::Secret>::all(client.clone()), ctlcfg.clone())
            .owns(Api::<core::v1::Service>::all(client.clone()), ctlcfg.clone())
            .owns(
                Api::<apps::v1::Deployment>::all(client.clone()),
                ctlcfg.clone(),
            )
            .reconcile_all_on(sig)
            .graceful_shutdown_on(cancel.cancelled_owned());
        info!("starting spicedbcluster controller");

        ctl.run(reconcile, error_policy, ctx)
            .for_each(|ret| {
                if let Err(err) = ret {
                    match err {
                        CtrlErr::ObjectNotFound(objref) => error!(%objref, "object not found"),
                        CtrlErr::ReconcilerFailed(error, objref) => {
                            error!(%objref, %error, "reconcile error")
                        }
                        CtrlErr::QueueError(error) => error!(%error, "queue error"),
                        CtrlErr::RunnerError(error) => error!(%error, "runner error"),
                    };
                }
                futures::future::ready(())
            })
            .await;
        debug!("spicedbcluster controller finished");
        Ok(())
    }
    .boxed())
}

fn error_policy(obj: Arc<SpiceDBCluster>, err: &Error, _ctx: Arc<Context>) -> Action {
    metrics::counter!("spicedb_operator_reconcile_failures_total").increment(1);
    error!(
        error = err.to_string(),
        obj.metadata.name, obj.metadata.uid, "reconcile error"
    );
    // Cluster-API failures back off longest, management-RPC failures in
    // between, everything else at the error cadence.
    let backoff = match err {
        Error::Kube(_) | Error::KubeConfig(_) => Duration::from_secs(30),
        Error::Grpc(_) | Error::Transport(_) => Duration::from_secs(10),
        _ => Duration::from_secs(5),
    };
    Action::requeue(backoff)
}

#[instrument(skip(ctx, cluster), fields(
    kind = SpiceDBCluster::kind(&()).as_ref(),
    namespace = cluster.namespace().unwrap(),
    name = cluster.name_any(),
    generation = cluster.metadata.generation,
    resource_version = cluster.metadata.resource_version
))]
async fn reconcile(cluster: Arc<SpiceDBCluster>, ctx: Arc<Context>) -> Result<Action> {
    metrics::counter!("spicedb_operator_reconciles_total").increment(1);
    let ns = cluster.namespace().unwrap();
    let api: Api<SpiceDBCluster> = Api::namespaced(ctx.client.clone(), &ns);

    info!(
        r#"reconciling SpiceDBCluster "{}" in {}"#,
        cluster.name_any(),
        ns
    );
    finalizer(&api, CLUSTER_FINALIZER, cluster, |event| async {
        match event {
            Finalizer::Apply(cluster) => reconcile_one(cluster, ctx.clone()).await,
            Finalizer::Cleanup(cluster) => cleanup_one(cluster, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

#[instrument(skip(ctx, cluster))]
async fn reconcile_one(cluster: Arc<SpiceDBCluster>, ctx: Arc<Context>) -> Result<Action> {
    let ns = cluster.namespace().expect("SpiceDBCluster is namespaced");
    let nn = NamespacedName::new(&ns, cluster.name_any());

    let queue = Arc::new(RequeueSink::default());
    let mut rctx = ReconcileContext::new(nn, cluster.clone(), queue.clone());
    if let Some(cmref) = cluster.spec.schema_config_map.as_ref() {
        rctx.set_schema_config_map_nn(NamespacedName::new(&ns, &cmref.name));
    }

    let pipeline = build_pipeline(&ctx, &cluster);
    pipeline.handle(&mut rctx).await;

    queue.outcome(DEFAULT_REQUEUE.clone())
}

/// Build_pipeline chains the reconcile stages: adopt the schema ConfigMap,
/// assemble the effective configuration, apply the workload, write the
/// schema, record completion.
fn build_pipeline(ctx: &Context, cluster: &SpiceDBCluster) -> Arc<dyn Handler> {
    let oref = cluster.object_ref(&());

    let terminal: Arc<dyn Handler> = Arc::new(Terminal);
    let ready: Arc<dyn Handler> = Arc::new(ReadyHandler {
        client: ctx.client.clone(),
        next: terminal,
    });

    let dial: DialFn = Box::new(|config| {
        let endpoint = schema_client::endpoint_for(&config.name, &config.namespace);
        let key = config.preshared_key.clone();
        Box::pin(async move {
            let client = SchemaServiceClient::connect(endpoint, &key).await?;
            Ok(Box::new(client) as Box<dyn SchemaConnection>)
        })
    });
    let patch_client = ctx.client.clone();
    let patch_status: PatchStatusFn = Box::new(move |nn, hash| {
        let api: Api<SpiceDBCluster> = Api::namespaced(patch_client.clone(), &nn.namespace);
        let name = nn.name.clone();
        let patch = json!({
            "apiVersion": SpiceDBCluster::api_version(&()),
            "kind": SpiceDBCluster::kind(&()),
            "status": { "schemaHash": hash },
        });
        Box::pin(async move {
            api.patch_status(&name, &PATCH_PARAMS, &Patch::Apply(&patch))
                .await
                .map(|_| ())
        })
    });
    let invalid_recorder = ctx.recorder.clone();
    let invalid_client = ctx.client.clone();
    let invalid_schema: InvalidSchemaHook = Box::new(move |rctx, status| {
        let recorder = invalid_recorder.clone();
        let client = invalid_client.clone();
        let oref = rctx.cluster().object_ref(&());
        let nn = rctx.cluster_nn().clone();
        let note = format!("schema was rejected by the cluster: {status}");
        let cnd = new_condition(
            schema_write_failed_condition(),
            "InvalidSchema",
            status,
            rctx.cluster().metadata.generation,
        );
        Box::pin(async move {
            let ev = Event {
                type_: EventType::Warning,
                reason: "InvalidSchema".into(),
                note: Some(note),
                action: "WriteSchema".into(),
                secondary: None,
            };
            if let Err(err) = recorder.publish(&ev, &oref).await {
                warn!(error = %err, "unable to publish event");
            }
            patch_condition(client, &nn, cnd).await;
        })
    });
    let schema: Arc<dyn Handler> = Arc::new(SchemaApplyHandler::new(
        dial,
        patch_status,
        invalid_schema,
        ready,
    ));

    let deploy: Arc<dyn Handler> = Arc::new(DeployHandler::new(ctx.client.clone(), schema));

    let secret_client = ctx.client.clone();
    let get_secret: SecretFetchFn = Box::new(move |nn| {
        let api: Api<Secret> = Api::namespaced(secret_client.clone(), &nn.namespace);
        let name = nn.name.clone();
        Box::pin(async move { api.get_opt(&name).await })
    });
    let invalid_recorder = ctx.recorder.clone();
    let invalid_client = ctx.client.clone();
    let invalid_config: InvalidConfigHook = Box::new(move |rctx, err| {
        let recorder = invalid_recorder.clone();
        let client = invalid_client.clone();
        let oref = rctx.cluster().object_ref(&());
        let nn = rctx.cluster_nn().clone();
        let note = format!("unable to compute a target version: {err}");
        let cnd = new_condition(
            validating_failed_condition(),
            "InvalidTarget",
            err,
            rctx.cluster().metadata.generation,
        );
        Box::pin(async move {
            let ev = Event {
                type_: EventType::Warning,
                reason: "ValidatingFailed".into(),
                note: Some(note),
                action: "Reconcile".into(),
                secondary: None,
            };
            if let Err(err) = recorder.publish(&ev, &oref).await {
                warn!(error = %err, "unable to publish event");
            }
            patch_condition(client, &nn, cnd).await;
        })
    });
    let config: Arc<dyn Handler> = Arc::new(ConfigHandler::new(
        ctx.graph.clone(),
        ctx.base_image.clone(),
        get_secret,
        invalid_config,
        deploy,
    ));

    let adopted_recorder = ctx.recorder.clone();
    let object_adopted: AdoptedHook = Box::new(move |rctx, cm| {
        let recorder = adopted_recorder.clone();
        let oref = cm.object_ref(&());
        let note = format!(
            "ConfigMap was referenced as the configuration source for SpiceDBCluster {}; \
             it has been labelled to mark it as part of the configuration for that controller.",
            rctx.cluster_nn()
        );
        Box::pin(async move {
            let ev = Event {
                type_: EventType::Normal,
                reason: EVENT_CONFIGMAP_ADOPTED.into(),
                note: Some(note),
                action: "Adopt".into(),
                secondary: None,
            };
            if let Err(err) = recorder.publish(&ev, &oref).await {
                warn!(error = %err, "unable to publish event");
            }
        })
    });
    let missing_recorder = ctx.recorder.clone();
    let missing_oref = oref.clone();
    let object_missing: MissingHook = Box::new(move |err| {
        let recorder = missing_recorder.clone();
        let oref = missing_oref.clone();
        let note = format!("referenced ConfigMap is absent: {err}");
        Box::pin(async move {
            let ev = Event {
                type_: EventType::Warning,
                reason: "SchemaConfigMapMissing".into(),
                note: Some(note),
                action: "Adopt".into(),
                secondary: None,
            };
            if let Err(err) = recorder.publish(&ev, &oref).await {
                warn!(error = %err, "unable to publish event");
            }
        })
    });

    Arc::new(ConfigMapAdoptionHandler::new(
        KubeConfigMapAccess::new(ctx.client.clone()),
        object_adopted,
        object_missing,
        config,
    ))
}

async fn patch_condition(client: kube::Client, nn: &NamespacedName, cnd: Condition) {
    let patch = json!({
        "apiVersion": SpiceDBCluster::api_version(&()),
        "kind": SpiceDBCluster::kind(&()),
        "status": { "conditions": [ cnd ] },
    });
    let api: Api<SpiceDBCluster> = Api::namespaced(client, &nn.namespace);
    if let Err(err) = api
        .patch_status(&nn.name, &PATCH_PARAMS, &Patch::Apply(&patch))
        .await
    {
        warn!(error = %err, "unable to patch status condition");
    }
}

/// ReadyHandler is the pipeline's terminal stage; it records that the
/// cluster's desired state was carried through every stage.
struct ReadyHandler {
    client: kube::Client,
    next: Arc<dyn Handler>,
}

impl Handler for ReadyHandler {
    fn handle<'c>(&'c self, ctx: &'c mut ReconcileContext) -> HandlerFuture<'c> {
        Box::pin(async move {
            let cnd = new_condition(
                reconciled_condition(),
                "ReconcileSuccess",
                "cluster configuration applied",
                ctx.cluster().metadata.generation,
            );
            patch_condition(self.client.clone(), ctx.cluster_nn(), cnd).await;
            self.next.handle(ctx).await
        })
    }
}

#[instrument(skip(ctx, cluster))]
async fn cleanup_one(cluster: Arc<SpiceDBCluster>, ctx: Arc<Context>) -> Result<Action> {
    let oref = cluster.object_ref(&());
    // No real cleanup, so we just publish an event.
    ctx.publish(
        Event {
            type_: EventType::Normal,
            reason: "DeleteRequested".into(),
            note: Some(format!("Delete `{}`", cluster.name_any())),
            action: "Deleting".into(),
            secondary: None,
        },
        &oref,
    )
    .await;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn clusters_without_finalizer_gets_a_finalizer() {
        let (testctx, fakeserver) = Context::cluster_tests();
        let c = cluster::test(None);
        let mocksrv = fakeserver.run(ClusterScenario::FinalizerCreation(c.clone()));
        reconcile(Arc::new(c), testctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn unresolvable_target_surfaces_validation_failure() {
        let (testctx, fakeserver) = Context::cluster_tests_with(updates::UpdateGraph::default());
        let c = cluster::finalized(cluster::test(None));
        let mocksrv = fakeserver.run(ClusterScenario::ValidationFailed(c.clone()));
        reconcile(Arc::new(c), testctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn error_policy_backs_off_api_errors_longest() {
        let (testctx, _fakeserver) = Context::cluster_tests();
        let c = Arc::new(cluster::test(None));

        let api = error_policy(c.clone(), &Error::Kube(api_error("boom")), testctx.clone());
        let rpc = error_policy(
            c.clone(),
            &Error::Grpc(tonic::Status::unavailable("restarting")),
            testctx.clone(),
        );
        let other = error_policy(c, &Error::Other(anyhow::anyhow!("boom")), testctx);

        assert_eq!(api, Action::requeue(Duration::from_secs(30)));
        assert_eq!(rpc, Action::requeue(Duration::from_secs(10)));
        assert_eq!(other, Action::requeue(Duration::from_secs(5)));
    }

    #[self::test(tokio::test(flavor = "multi_thread", worker_threads = 1))]
    async fn ready_clusters_apply_workload_and_record_status() {
        let (testctx, fakeserver) = Context::cluster_tests();
        let c = cluster::ready();
        let mocksrv = fakeserver.run(ClusterScenario::Ready(c.clone()));
        reconcile(Arc::new(c), testctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }
}

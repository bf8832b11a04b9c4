//! Adoption claims externally-created schema ConfigMaps for a cluster by
//! labelling and annotating them, then publishes them into the reconcile
//! context for the stages after it.

use std::sync::Arc;

use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::context::{NamespacedName, ReconcileContext};
use crate::handler::{Handler, HandlerFuture};
use crate::{
    MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE, OWNED_ANNOTATION_VALUE, owner_annotation,
    owner_field_manager,
};

/// ConfigMapAccess is the slice of the cluster API the adoption handler
/// needs: a read-through cache, an existence probe, and server-side apply.
pub trait ConfigMapAccess: Send + Sync {
    /// Get_cached reads the ConfigMap through the watch cache.
    fn get_cached<'a>(
        &'a self,
        nn: &'a NamespacedName,
    ) -> BoxFuture<'a, Result<ConfigMap, kube::Error>>;
    /// Exists probes the cluster API directly for the ConfigMap.
    fn exists<'a>(&'a self, nn: &'a NamespacedName) -> BoxFuture<'a, Result<bool, kube::Error>>;
    /// Apply server-side-applies `patch` under `field_manager`.
    fn apply<'a>(
        &'a self,
        nn: &'a NamespacedName,
        field_manager: &'a str,
        patch: Value,
    ) -> BoxFuture<'a, Result<ConfigMap, kube::Error>>;
}

/// AdoptedHook runs after a ConfigMap is newly adopted, before the next stage.
pub type AdoptedHook = Box<
    dyn Fn(&ReconcileContext, &ConfigMap) -> BoxFuture<'static, ()> + Send + Sync,
>;

/// MissingHook runs when the referenced ConfigMap does not exist; the
/// pipeline halts afterwards.
pub type MissingHook = Box<dyn Fn(&kube::Error) -> BoxFuture<'static, ()> + Send + Sync>;

/// ConfigMapAdoptionHandler idempotently adopts the ConfigMap named by the
/// context's adoptee key.
///
/// An already-labelled and -annotated ConfigMap is republished without any
/// apply calls; otherwise only the missing label and/or annotation is applied
/// under the cluster's ownership field manager.
pub struct ConfigMapAdoptionHandler<A> {
    access: A,
    object_adopted: AdoptedHook,
    object_missing: MissingHook,
    next: Arc<dyn Handler>,
}

impl<A: ConfigMapAccess> ConfigMapAdoptionHandler<A> {
    /// New assembles the handler.
    pub fn new(
        access: A,
        object_adopted: AdoptedHook,
        object_missing: MissingHook,
        next: Arc<dyn Handler>,
    ) -> Self {
        Self {
            access,
            object_adopted,
            object_missing,
            next,
        }
    }
}

impl<A: ConfigMapAccess> Handler for ConfigMapAdoptionHandler<A> {
    fn handle<'c>(&'c self, ctx: &'c mut ReconcileContext) -> HandlerFuture<'c> {
        Box::pin(async move {
            let Some(nn) = ctx.schema_config_map_nn().cloned() else {
                trace!("no schema ConfigMap referenced");
                return self.next.handle(ctx).await;
            };

            let cached = match self.access.get_cached(&nn).await {
                Ok(cm) => Some(cm),
                Err(err) if is_not_found(&err) => match self.access.exists(&nn).await {
                    Ok(true) => None,
                    Ok(false) => {
                        debug!(%nn, "referenced ConfigMap does not exist");
                        return (self.object_missing)(&err).await;
                    }
                    Err(err) => return ctx.queue().requeue_api_err(err.into()),
                },
                Err(err) => return ctx.queue().requeue_api_err(err.into()),
            };

            let annotation_key = owner_annotation(&ctx.cluster_nn().name);
            if let Some(cm) = cached
                .as_ref()
                .filter(|cm| has_managed_label(cm) && has_owner_annotation(cm, &annotation_key))
            {
                trace!(%nn, "ConfigMap already adopted");
                ctx.set_schema_config_map(cm.clone());
                return self.next.handle(ctx).await;
            }

            let manager = owner_field_manager(&ctx.cluster_nn().namespace, &ctx.cluster_nn().name);
            let needs_label = !cached.as_ref().is_some_and(has_managed_label);
            let needs_annotation = !cached
                .as_ref()
                .is_some_and(|cm| has_owner_annotation(cm, &annotation_key));

            let mut adopted = cached;
            if needs_label {
                match self.access.apply(&nn, &manager, label_patch(&nn)).await {
                    Ok(cm) => adopted = Some(cm),
                    Err(err) => return ctx.queue().requeue_api_err(err.into()),
                }
            }
            if needs_annotation {
                let patch = annotation_patch(&nn, &annotation_key);
                match self.access.apply(&nn, &manager, patch).await {
                    Ok(cm) => adopted = Some(cm),
                    Err(err) => return ctx.queue().requeue_api_err(err.into()),
                }
            }

            let adopted = adopted.expect("at least one ownership apply succeeded");
            debug!(%nn, "adopted ConfigMap");
            (self.object_adopted)(ctx, &adopted).await;
            ctx.set_schema_config_map(adopted);
            self.next.handle(ctx).await
        })
    }
}

/// KubeConfigMapAccess serves [ConfigMapAccess] from a kube client.
pub struct KubeConfigMapAccess {
    client: kube::Client,
}

impl KubeConfigMapAccess {
    /// New wraps a client.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, nn: &NamespacedName) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &nn.namespace)
    }
}

impl ConfigMapAccess for KubeConfigMapAccess {
    fn get_cached<'a>(
        &'a self,
        nn: &'a NamespacedName,
    ) -> BoxFuture<'a, Result<ConfigMap, kube::Error>> {
        Box::pin(async move { self.api(nn).get(&nn.name).await })
    }

    fn exists<'a>(&'a self, nn: &'a NamespacedName) -> BoxFuture<'a, Result<bool, kube::Error>> {
        Box::pin(async move { Ok(self.api(nn).get_opt(&nn.name).await?.is_some()) })
    }

    fn apply<'a>(
        &'a self,
        nn: &'a NamespacedName,
        field_manager: &'a str,
        patch: Value,
    ) -> BoxFuture<'a, Result<ConfigMap, kube::Error>> {
        Box::pin(async move {
            let params = PatchParams::apply(field_manager).force();
            self.api(nn)
                .patch(&nn.name, &params, &Patch::Apply(&patch))
                .await
        })
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn has_managed_label(cm: &ConfigMap) -> bool {
    cm.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_LABEL_KEY))
        .is_some_and(|v| v == MANAGED_LABEL_VALUE)
}

fn has_owner_annotation(cm: &ConfigMap, key: &str) -> bool {
    cm.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .is_some_and(|v| v == OWNED_ANNOTATION_VALUE)
}

// The ownership applies carry only the operator's owned fields, never the
// schema payload.
fn label_patch(nn: &NamespacedName) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": nn.name,
            "namespace": nn.namespace,
            "labels": { (MANAGED_LABEL_KEY): MANAGED_LABEL_VALUE },
        },
    })
}

fn annotation_patch(nn: &NamespacedName, annotation_key: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": nn.name,
            "namespace": nn.namespace,
            "annotations": { (annotation_key): OWNED_ANNOTATION_VALUE },
        },
    })
}

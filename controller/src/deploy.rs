//! Deploy applies the desired workload state for a cluster: its Deployment
//! and the Service the management RPC dials.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, SecretKeySelector,
    Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use kube::api::{Api, Patch};
use serde_json::json;
use tracing::{debug, trace, warn};

use api::v1alpha1::SpiceDBCluster;

use crate::config::Config;
use crate::context::ReconcileContext;
use crate::handler::{Handler, HandlerFuture};
use crate::{
    COMPONENT_LABEL, INSTANCE_LABEL, PATCH_PARAMS, PRESHARED_KEY_KEY, SPICEDB_GRPC_PORT,
};

/// DeployHandler server-side-applies the Deployment and Service rendered from
/// the effective configuration, then records the applied target version on
/// the cluster status.
pub struct DeployHandler {
    client: kube::Client,
    next: Arc<dyn Handler>,
}

impl DeployHandler {
    /// New assembles the handler.
    pub fn new(client: kube::Client, next: Arc<dyn Handler>) -> Self {
        Self { client, next }
    }
}

impl Handler for DeployHandler {
    fn handle<'c>(&'c self, ctx: &'c mut ReconcileContext) -> HandlerFuture<'c> {
        Box::pin(async move {
            let config = ctx.must_config().clone();
            let (deployment, service, status_patch) = {
                let cluster = ctx.cluster();
                let status = cluster.status.clone().unwrap_or_default();
                let changed = status.current_version != config.target
                    || status.image.as_deref() != Some(config.image.as_str());
                let patch = changed.then(|| {
                    json!({
                        "apiVersion": SpiceDBCluster::api_version(&()),
                        "kind": SpiceDBCluster::kind(&()),
                        "status": {
                            "currentVersion": &config.target,
                            "availableVersions": &config.available,
                            "image": &config.image,
                        },
                    })
                });
                (
                    build_deployment(&config, cluster),
                    build_service(&config, cluster),
                    patch,
                )
            };

            let deployments: Api<Deployment> =
                Api::namespaced(self.client.clone(), &config.namespace);
            if let Err(err) = deployments
                .patch(&config.name, &PATCH_PARAMS, &Patch::Apply(&deployment))
                .await
            {
                return ctx.queue().requeue_api_err(err.into());
            }
            trace!(name = config.name, "applied Deployment");

            let services: Api<Service> = Api::namespaced(self.client.clone(), &config.namespace);
            if let Err(err) = services
                .patch(&config.name, &PATCH_PARAMS, &Patch::Apply(&service))
                .await
            {
                return ctx.queue().requeue_api_err(err.into());
            }
            trace!(name = config.name, "applied Service");

            if let Some(patch) = status_patch {
                debug!(image = config.image, "recording applied version");
                let clusters: Api<SpiceDBCluster> =
                    Api::namespaced(self.client.clone(), &config.namespace);
                if let Err(err) = clusters
                    .patch_status(&config.name, &PATCH_PARAMS, &Patch::Apply(&patch))
                    .await
                {
                    warn!(error = %err, "unable to record applied version");
                }
            }

            self.next.handle(ctx).await
        })
    }
}

fn selector_labels(config: &Config) -> BTreeMap<String, String> {
    BTreeMap::from([
        (COMPONENT_LABEL.clone(), "spicedb".to_string()),
        (INSTANCE_LABEL.clone(), config.name.clone()),
    ])
}

/// Build_deployment renders the Deployment for the cluster's workload.
pub fn build_deployment(config: &Config, cluster: &SpiceDBCluster) -> Deployment {
    let labels = selector_labels(config);
    let mut env = vec![EnvVar {
        name: "SPICEDB_GRPC_PRESHARED_KEY".into(),
        value_from: cluster.spec.secret_name.as_ref().map(|name| EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: name.clone(),
                key: PRESHARED_KEY_KEY.into(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }];
    if let Some(engine) = cluster.spec.datastore_engine.as_ref() {
        env.push(EnvVar {
            name: "SPICEDB_DATASTORE_ENGINE".into(),
            value: Some(engine.clone()),
            ..Default::default()
        });
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: cluster.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "spicedb".into(),
                        image: Some(config.image.clone()),
                        args: Some(vec!["serve".into()]),
                        env: Some(env),
                        ports: Some(vec![ContainerPort {
                            name: Some("grpc".into()),
                            container_port: i32::from(SPICEDB_GRPC_PORT),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build_service renders the Service the management RPC endpoint resolves to.
pub fn build_service(config: &Config, cluster: &SpiceDBCluster) -> Service {
    let labels = selector_labels(config);
    Service {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: cluster.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("grpc".into()),
                port: i32::from(SPICEDB_GRPC_PORT),
                target_port: Some(IntOrString::Int(i32::from(SPICEDB_GRPC_PORT))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn deployment_runs_the_resolved_image() {
        let config = Config {
            image: "ghcr.io/authzed/spicedb:v1.0.1".into(),
            ..testing::config()
        };
        let cluster = testing::cluster::with_engine("cockroachdb");
        let d = build_deployment(&config, &cluster);

        assert_eq!(d.metadata.name.as_deref(), Some("test"));
        let podspec = d.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            podspec.containers[0].image.as_deref(),
            Some("ghcr.io/authzed/spicedb:v1.0.1")
        );
        let env = podspec.containers[0].env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "SPICEDB_DATASTORE_ENGINE"
            && e.value.as_deref() == Some("cockroachdb")));
    }

    #[test]
    fn service_selects_the_deployment_on_the_grpc_port() {
        let config = testing::config();
        let cluster = testing::cluster::test(None);
        let s = build_service(&config, &cluster);

        assert_eq!(s.metadata.name.as_deref(), Some("test"));
        let spec = s.spec.unwrap();
        assert_eq!(spec.ports.as_ref().unwrap()[0].port, 50051);
        assert_eq!(
            spec.selector.as_ref().unwrap().get(&*INSTANCE_LABEL),
            Some(&"test".to_string())
        );
    }

    #[test]
    fn preshared_key_comes_from_the_referenced_secret() {
        let config = testing::config();
        let mut cluster = testing::cluster::test(None);
        cluster.spec.secret_name = Some("dev-spicedb-config".into());
        let d = build_deployment(&config, &cluster);

        let podspec = d.spec.unwrap().template.spec.unwrap();
        let env = podspec.containers[0].env.as_ref().unwrap();
        let key = env
            .iter()
            .find(|e| e.name == "SPICEDB_GRPC_PRESHARED_KEY")
            .unwrap();
        let sel = key
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(sel.name, "dev-spicedb-config");
        assert_eq!(sel.key, PRESHARED_KEY_KEY);
    }
}

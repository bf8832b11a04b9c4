//! Context carries the typed attribute bag threaded through every pipeline
//! stage of a single reconcile.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;

use api::v1alpha1::SpiceDBCluster;

use crate::config::Config;
use crate::handler::QueueOperations;

/// NamespacedName identifies an object within the cluster API.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct NamespacedName {
    /// The object's namespace.
    pub namespace: String,
    /// The object's name.
    pub name: String,
}

impl NamespacedName {
    /// New builds a NamespacedName from its parts.
    pub fn new<S: ToString, T: ToString>(namespace: S, name: T) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// ReconcileContext is the per-reconcile attribute bag.
///
/// The key set is fixed at compile time. Keys that stages publish during the
/// run expose a `value`/`must_value` accessor pair; the `must_` form panics
/// and is reserved for points where an earlier stage has guaranteed presence.
pub struct ReconcileContext {
    cluster_nn: NamespacedName,
    cluster: Arc<SpiceDBCluster>,
    queue: Arc<dyn QueueOperations>,
    schema_config_map_nn: Option<NamespacedName>,
    schema_config_map: Option<ConfigMap>,
    config: Option<Config>,
}

impl ReconcileContext {
    /// New seeds a context with the keys every reconcile starts from.
    pub fn new(
        cluster_nn: NamespacedName,
        cluster: Arc<SpiceDBCluster>,
        queue: Arc<dyn QueueOperations>,
    ) -> Self {
        Self {
            cluster_nn,
            cluster,
            queue,
            schema_config_map_nn: None,
            schema_config_map: None,
            config: None,
        }
    }

    /// Cluster_nn is the identity of the cluster being reconciled.
    pub fn cluster_nn(&self) -> &NamespacedName {
        &self.cluster_nn
    }

    /// Cluster is the cluster object being reconciled.
    pub fn cluster(&self) -> &SpiceDBCluster {
        &self.cluster
    }

    /// Queue is the deferral collaborator for this reconcile.
    pub fn queue(&self) -> &dyn QueueOperations {
        self.queue.as_ref()
    }

    /// Schema_config_map_nn names the referenced schema ConfigMap, if any.
    pub fn schema_config_map_nn(&self) -> Option<&NamespacedName> {
        self.schema_config_map_nn.as_ref()
    }

    /// Set_schema_config_map_nn publishes the adoptee's identity.
    pub fn set_schema_config_map_nn(&mut self, nn: NamespacedName) {
        self.schema_config_map_nn = Some(nn);
    }

    /// Schema_config_map is the adopted ConfigMap, once retrieved.
    pub fn schema_config_map(&self) -> Option<&ConfigMap> {
        self.schema_config_map.as_ref()
    }

    /// Must_schema_config_map panics when no ConfigMap has been adopted.
    pub fn must_schema_config_map(&self) -> &ConfigMap {
        self.schema_config_map
            .as_ref()
            .expect("schema ConfigMap not published to context")
    }

    /// Set_schema_config_map publishes the adopted ConfigMap.
    pub fn set_schema_config_map(&mut self, cm: ConfigMap) {
        self.schema_config_map = Some(cm);
    }

    /// Config is the effective configuration, once assembled.
    pub fn config(&self) -> Option<&Config> {
        self.config.as_ref()
    }

    /// Must_config panics when the effective configuration has not been
    /// assembled yet.
    pub fn must_config(&self) -> &Config {
        self.config
            .as_ref()
            .expect("effective configuration not published to context")
    }

    /// Set_config publishes the effective configuration.
    pub fn set_config(&mut self, config: Config) {
        self.config = Some(config);
    }
}

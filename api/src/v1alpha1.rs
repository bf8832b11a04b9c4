//! Module `v1alpha1` implements the v1alpha1 SpiceDBCluster CRD API.
use k8s_openapi::{DeepMerge, apimachinery::pkg::apis::meta, merge_strategies};
use kube::{CustomResource, KubeSchema};
use schemars;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// VERSION is the kubernetes API group's version.
pub static VERSION: &str = "v1alpha1";

/// ClusterSpec describes the desired state of a SpiceDB cluster.
#[derive(
    KubeSchema, Clone, CustomResource, Debug, Default, Deserialize, PartialEq, Serialize, Validate,
)]
#[kube(
    group = "authzed.com",
    version = "v1alpha1",
    kind = "SpiceDBCluster",
    namespaced,
    status = "ClusterStatus",
    shortname = "spicedbs",
    category = "apps",
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Channel","type":"string","jsonPath":".spec.channel"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.currentVersion.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Channel is the name of the release channel to follow.
    ///
    /// If unset, the operator picks the channel for the configured datastore
    /// engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Version pins a specific release from the channel.
    ///
    /// If unset, the operator walks the update graph one supported step at a
    /// time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// DatastoreEngine names the backing datastore (postgres, cockroachdb,
    /// memory, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datastore_engine: Option<String>,
    /// Image overrides the container image, either as a bare repository or as
    /// a pinned `repository:tag` reference.
    ///
    /// A pinned reference bypasses the update graph entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// BaseImage overrides the repository that graph-resolved tags are
    /// appended to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    /// SchemaConfigMap references a ConfigMap in the cluster's namespace
    /// whose `schema` key holds the policy schema to write into SpiceDB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_config_map: Option<ConfigMapRef>,
    /// SecretName is the Secret holding the preshared key under the
    /// `preshared_key` key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

impl DeepMerge for ClusterSpec {
    fn merge_from(&mut self, other: Self) {
        self.channel.merge_from(other.channel);
        self.version.merge_from(other.version);
        self.datastore_engine.merge_from(other.datastore_engine);
        self.image.merge_from(other.image);
        self.base_image.merge_from(other.base_image);
        self.schema_config_map.merge_from(other.schema_config_map);
        self.secret_name.merge_from(other.secret_name);
    }
}

/// ConfigMapRef names a ConfigMap in the same namespace.
#[derive(
    Clone, Default, Debug, Deserialize, PartialEq, PartialOrd, Eq, Ord, Serialize, Validate,
    KubeSchema,
)]
#[serde(rename_all = "camelCase")]
#[x_kube(validation = ("self.name != ''", r#""name" must be populated"#))]
pub struct ConfigMapRef {
    /// The name of the referent.
    pub name: String,
}

impl DeepMerge for ConfigMapRef {
    fn merge_from(&mut self, other: Self) {
        if !other.name.is_empty() {
            self.name = other.name.clone();
        }
    }
}

/// ClusterStatus describes the observed state of a SpiceDB cluster.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Conditions reports k8s-style conditions for various parts of the system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "schema::conditions")]
    pub conditions: Option<Vec<meta::v1::Condition>>,

    /// SchemaHash is the content hash of the last schema successfully written
    /// into the running cluster.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schema_hash: String,

    /// CurrentVersion is the release the operator last rolled the cluster to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<SpiceDBVersion>,

    /// AvailableVersions enumerates the releases the cluster could safely
    /// move to from its current version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_versions: Option<Vec<SpiceDBVersion>>,

    /// Image is the fully resolved image reference for the managed
    /// deployment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ClusterStatus {
    /// Condition returns the condition of the requested type, if present.
    pub fn condition<S: AsRef<str>>(&self, type_: S) -> Option<&meta::v1::Condition> {
        self.conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|c| c.type_ == type_.as_ref())
    }

    /// Has_condition reports whether a condition of the requested type is
    /// present with status "True".
    pub fn has_condition<S: AsRef<str>>(&self, type_: S) -> bool {
        self.condition(type_).is_some_and(|c| c.status == "True")
    }
}

/// Cmp_condition compares conditions by type, for use as a list-map merge key.
pub fn cmp_condition(a: &meta::v1::Condition, b: &meta::v1::Condition) -> bool {
    a.type_ == b.type_
}

/// Merge_condition replaces a condition wholesale during a list-map merge.
pub fn merge_condition(a: &mut meta::v1::Condition, b: meta::v1::Condition) {
    *a = b;
}

impl DeepMerge for ClusterStatus {
    fn merge_from(&mut self, other: Self) {
        if let Some(cnds) = self.conditions.as_mut() {
            merge_strategies::list::map(
                cnds,
                other.conditions.unwrap_or_default(),
                &[cmp_condition],
                merge_condition,
            );
        } else {
            self.conditions = other.conditions;
        }
        if !other.schema_hash.is_empty() {
            self.schema_hash = other.schema_hash;
        }
        self.current_version.merge_from(other.current_version);
        if other.available_versions.is_some() {
            self.available_versions = other.available_versions;
        }
        self.image.merge_from(other.image);
    }
}

/// SpiceDBVersion describes one release a cluster runs or can move to.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, KubeSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpiceDBVersion {
    /// Name is the release's version label.
    pub name: String,
    /// Channel is the release channel the version was selected from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    /// Attributes qualify how the version relates to the cluster's current
    /// version.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<SpiceDBVersionAttribute>,
    /// Description is a human-readable summary of what rolling to this
    /// version entails.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl DeepMerge for SpiceDBVersion {
    fn merge_from(&mut self, other: Self) {
        *self = other;
    }
}

/// SpiceDBVersionAttribute qualifies a version offered by the update graph.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SpiceDBVersionAttribute {
    /// Next marks a version directly reachable in one supported hop.
    Next,
    /// Latest marks the head of the channel.
    Latest,
    /// Migration marks a version that runs a datastore migration.
    Migration,
}

impl std::fmt::Display for SpiceDBVersionAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpiceDBVersionAttribute::Next => write!(f, "next"),
            SpiceDBVersionAttribute::Latest => write!(f, "latest"),
            SpiceDBVersionAttribute::Migration => write!(f, "migration"),
        }
    }
}

mod schema {
    use k8s_openapi::apimachinery::pkg::apis::meta;
    use schemars::{Schema, generate::SchemaGenerator};
    use serde_json::json;

    /// Conditions returns the schema for a status condition list.
    ///
    /// The operator patches conditions with server-side apply, which only
    /// merges entries by condition type when the list is declared as a map
    /// keyed on `type`.
    pub fn conditions(generator: &mut SchemaGenerator) -> Schema {
        let mut items = generator.subschema_for::<meta::v1::Condition>();
        items.ensure_object().entry("required").or_insert_with(|| {
            json!(["type", "status", "lastTransitionTime", "reason", "message"])
        });

        let mut schema = generator.subschema_for::<Vec<meta::v1::Condition>>();
        let obj = schema.ensure_object();
        obj.entry("x-kubernetes-list-type")
            .or_insert_with(|| json!("map"));
        obj.entry("x-kubernetes-list-map-keys")
            .or_insert_with(|| json!(["type"]));
        obj.insert("items".into(), items.into());

        schema
    }
}

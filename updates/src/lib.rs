#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

//! Updates models the release channels a SpiceDB cluster can follow and
//! answers the questions the controller asks of them: which channel serves a
//! datastore, which versions a cluster can safely move to, and which concrete
//! release (and image) the next roll-out should use.
//!
//! The graph is loaded once at process start and never mutated afterwards;
//! every query borrows it immutably.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use api::v1alpha1::{SpiceDBVersion, SpiceDBVersionAttribute};

/// Error is the validation and lookup failures the graph can report.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// NoChannelForDatastore means no channel serves the requested datastore.
    #[error("no channel found for datastore {0:?}")]
    NoChannelForDatastore(String),
    /// NoSource means the channel a version claims to come from is unknown.
    #[error("no source found for channel {0:?}")]
    NoSource(String),
    /// MissingNodes means a channel declares edges over an empty node list.
    #[error("channel {0:?}: missing nodes")]
    MissingNodes(String),
    /// MissingEdges means a multi-node channel declares no edges.
    #[error("channel {0:?}: missing edges")]
    MissingEdges(String),
    /// NoBaseImage means neither an image nor a base image was supplied.
    #[error("no base image in operator config or cluster spec")]
    NoBaseImage,
    /// NoChannel means channel resolution produced no known channel.
    #[error("no channel found for {0:?}")]
    NoChannel(String),
    /// NoCurrentState means a rolling update was requested with no current
    /// version to pin to.
    #[error("no current state for rolling update")]
    NoCurrentState,
    /// NoPath means the current version has no supported upgrade edge.
    #[error("no update path from {0:?}")]
    NoPath(String),
    /// VersionNotFound means an explicitly requested version is not in the
    /// channel.
    #[error("version {version:?} not found in channel {channel:?}")]
    VersionNotFound {
        /// The requested version id.
        version: String,
        /// The channel that was searched.
        channel: String,
    },
    /// Io reports a failure reading the graph file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Yaml reports a failure deserializing the graph file.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result typedef for graph queries.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// EdgeSet maps a node id to the ids it has a supported direct update to.
///
/// Destinations are listed oldest-first, matching the published graph files.
pub type EdgeSet = BTreeMap<String, Vec<String>>;

/// State is one release node in a channel.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct State {
    /// ID is the version label, unique within the channel.
    #[serde(default)]
    pub id: String,
    /// Tag is a container image tag, set when the state was resolved from a
    /// pinned image reference rather than graph traversal.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    /// Migration names the datastore migration this release runs, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub migration: String,
    /// Metadata carries free-form per-release annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Channel is an ordered release lineage sharing a datastore engine.
///
/// Nodes are head-first: `nodes[0]` is the newest release.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Channel {
    /// Name identifies the channel; lookups are case-insensitive.
    pub name: String,
    /// Metadata describes the channel; the `datastore` key names the engine
    /// the channel serves.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Edges is the supported-update adjacency map.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub edges: EdgeSet,
    /// Nodes is the head-first release list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<State>,
}

impl Channel {
    /// Head returns the newest release in the channel.
    pub fn head(&self) -> Option<&State> {
        self.nodes.first()
    }

    fn node(&self, id: &str) -> Option<&State> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node_index reports the head-first position of `id`; 0 is the head.
    fn node_index(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    fn successors(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or_default()
    }
}

/// UpdateGraph is the full set of channels published for a release stream.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct UpdateGraph {
    /// Channels, in publication order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<Channel>,
}

impl UpdateGraph {
    /// From_yaml deserializes a graph from its published YAML form.
    pub fn from_yaml(buf: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(buf)?)
    }

    /// Load reads and deserializes the graph file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_yaml(&std::fs::read(path)?)
    }

    fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Channel_for_datastore returns the name of the first channel whose
    /// `datastore` metadata matches `datastore`, case-insensitively.
    pub fn channel_for_datastore<S: AsRef<str>>(&self, datastore: S) -> Result<String> {
        let want = datastore.as_ref().to_lowercase();
        self.channels
            .iter()
            .find(|c| {
                c.metadata
                    .get("datastore")
                    .is_some_and(|d| d.to_lowercase() == want)
            })
            .map(|c| c.name.clone())
            .ok_or(Error::NoChannelForDatastore(want))
    }

    /// Available_versions enumerates the releases `current` can safely move
    /// to, in ascending version order.
    ///
    /// Only direct edge successors and the channel head are reported; a
    /// cluster already at the head gets an empty list.
    pub fn available_versions(
        &self,
        engine: &str,
        current: &SpiceDBVersion,
    ) -> Result<Vec<SpiceDBVersion>> {
        let name = if current.channel.is_empty() {
            self.channel_for_datastore(engine)
                .map_err(|_| Error::NoSource(engine.to_lowercase()))?
        } else {
            current.channel.clone()
        };
        let channel = self
            .channel(&name)
            .ok_or_else(|| Error::NoSource(name.clone()))?;
        if channel.nodes.is_empty() && !channel.edges.is_empty() {
            return Err(Error::MissingNodes(channel.name.clone()));
        }
        if channel.edges.is_empty() && channel.nodes.len() > 1 {
            return Err(Error::MissingEdges(channel.name.clone()));
        }

        // A current version that is no longer in the channel sorts older than
        // everything still published.
        let current_index = channel
            .node_index(&current.name)
            .unwrap_or(channel.nodes.len());
        let next = channel.successors(&current.name);

        let mut available = Vec::new();
        for (index, node) in channel.nodes.iter().enumerate().rev() {
            if index >= current_index {
                continue;
            }
            let is_next = next.iter().any(|id| *id == node.id);
            let is_latest = index == 0;
            if !is_next && !is_latest {
                continue;
            }
            let is_migration = !node.migration.is_empty();

            let mut attributes = Vec::new();
            if is_next {
                attributes.push(SpiceDBVersionAttribute::Next);
            }
            if is_latest {
                attributes.push(SpiceDBVersionAttribute::Latest);
            }
            if is_migration {
                attributes.push(SpiceDBVersionAttribute::Migration);
            }

            available.push(SpiceDBVersion {
                name: node.id.clone(),
                channel: channel.name.clone(),
                attributes,
                description: describe(is_next, is_latest, is_migration).into(),
            });
        }
        Ok(available)
    }

    /// Compute_target resolves the release the caller should roll to next and
    /// the base image to run it from.
    ///
    /// A pinned `repository:tag` image short-circuits the graph entirely and
    /// yields a tag-only [State] with no target descriptor. A `rolling`
    /// caller is mid-rollout and is pinned to its current version.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_target(
        &self,
        base_image: &str,
        image: &str,
        version: &str,
        channel: &str,
        engine: &str,
        current: Option<&SpiceDBVersion>,
        rolling: bool,
    ) -> Result<(String, Option<SpiceDBVersion>, State)> {
        if image.is_empty() && base_image.is_empty() {
            return Err(Error::NoBaseImage);
        }
        let base = if image.is_empty() {
            base_image
        } else {
            // An explicit tag pins the deployment; the graph is not consulted.
            if let Some((repository, tag)) = image.rsplit_once(':') {
                return Ok((
                    repository.to_string(),
                    None,
                    State {
                        tag: tag.to_string(),
                        ..Default::default()
                    },
                ));
            }
            image
        };

        let name = if !channel.is_empty() {
            channel.to_string()
        } else if let Some(cur) = current.filter(|c| !c.channel.is_empty()) {
            cur.channel.clone()
        } else {
            self.channel_for_datastore(engine)
                .map_err(|_| Error::NoChannel(engine.to_lowercase()))?
        };
        let channel = self.channel(&name).ok_or(Error::NoChannel(name))?;

        if rolling {
            let current = current.ok_or(Error::NoCurrentState)?;
            let state = channel.node(&current.name).cloned().unwrap_or(State {
                id: current.name.clone(),
                ..Default::default()
            });
            return Ok((base.to_string(), Some(current.clone()), state));
        }

        let state = if !version.is_empty() {
            channel
                .node(version)
                .cloned()
                .ok_or_else(|| Error::VersionNotFound {
                    version: version.to_string(),
                    channel: channel.name.clone(),
                })?
        } else {
            let head = channel
                .head()
                .ok_or_else(|| Error::MissingNodes(channel.name.clone()))?;
            match current {
                None => head.clone(),
                Some(cur) if cur.name == head.id => head.clone(),
                Some(cur) => {
                    if channel.edges.is_empty() {
                        return Err(Error::MissingEdges(channel.name.clone()));
                    }
                    // The farthest single supported hop toward the head.
                    channel
                        .successors(&cur.name)
                        .iter()
                        .filter_map(|id| channel.node_index(id).map(|index| (index, id)))
                        .min_by_key(|(index, _)| *index)
                        .and_then(|(_, id)| channel.node(id))
                        .cloned()
                        .ok_or_else(|| Error::NoPath(cur.name.clone()))?
                }
            }
        };

        let target = SpiceDBVersion {
            name: state.id.clone(),
            channel: channel.name.clone(),
            ..Default::default()
        };
        Ok((base.to_string(), Some(target), state))
    }
}

fn describe(next: bool, latest: bool, migration: bool) -> &'static str {
    match (next, latest, migration) {
        (true, false, false) => "direct update with no migrations",
        (true, false, true) => "update will run a migration",
        (true, true, false) => "direct update with no migrations, head of channel",
        (true, true, true) => "update will run a migration, head of channel",
        (false, true, _) => "head of the channel, multiple updates will run in sequence",
        (false, false, _) => unreachable!("non-next, non-latest candidates are filtered"),
    }
}

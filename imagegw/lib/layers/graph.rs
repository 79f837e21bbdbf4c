use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{registry::SignedManifest, GatewayResult, RegistryProtocolError};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One layer of an image, reconstructed from a manifest history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerNode {
    /// The layer id.
    pub id: String,

    /// The id of the layer below, absent for the base layer.
    pub parent: Option<String>,

    /// Digest of the layer blob.
    pub blob_digest: String,

    /// Environment of the layer configuration.
    pub env: Vec<String>,

    /// Entrypoint of the layer configuration.
    pub entrypoint: Option<Vec<String>>,

    /// Working directory of the layer configuration.
    pub workdir: Option<String>,

    /// Labels of the layer configuration.
    pub labels: BTreeMap<String, String>,

    /// Arena index of the layer above.
    pub child: Option<usize>,
}

/// The linear ancestry of an image's layers, stored as an arena.
#[derive(Debug, Clone)]
pub struct LayerGraph {
    nodes: Vec<LayerNode>,
    chain: Vec<usize>,
}

/// The image level metadata taken from the topmost layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// The image id.
    pub id: String,

    /// Environment variables.
    #[serde(default)]
    pub env: Vec<String>,

    /// Entrypoint.
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,

    /// Working directory, absent when empty.
    #[serde(default)]
    pub workdir: Option<String>,

    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct V1Compatibility {
    #[serde(default)]
    id: Option<String>,

    #[serde(default)]
    parent: Option<String>,

    #[serde(default)]
    config: Option<V1Config>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct V1Config {
    #[serde(default)]
    env: Option<Vec<String>>,

    #[serde(default)]
    entrypoint: Option<StringOrList>,

    #[serde(default)]
    working_dir: Option<String>,

    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerGraph {
    /// Builds the layer chain from a manifest's history.
    ///
    /// `history[i]` is paired with `fs_layers[i]`. Exactly one entry may lack a parent. Repeated
    /// `(parent, id)` pairs are skipped, a parent claimed by two different ids is rejected, and
    /// the walk from the root is bounded by a visited set.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidLayerGraph` when the history does not form a single chain and
    /// `MalformedManifest` when a history entry is not valid JSON.
    pub fn build(manifest: &SignedManifest) -> GatewayResult<Self> {
        if manifest.fs_layers.len() != manifest.history.len() {
            return Err(RegistryProtocolError::MalformedManifest(format!(
                "{} layers but {} history entries",
                manifest.fs_layers.len(),
                manifest.history.len()
            ))
            .into());
        }

        let mut nodes: Vec<LayerNode> = Vec::with_capacity(manifest.history.len());
        let mut by_parent: HashMap<String, usize> = HashMap::new();
        let mut seen: HashSet<(Option<String>, String)> = HashSet::new();
        let mut root: Option<usize> = None;

        for (position, (layer, entry)) in manifest
            .fs_layers
            .iter()
            .zip(&manifest.history)
            .enumerate()
        {
            let v1: V1Compatibility = serde_json::from_str(&entry.v1_compatibility)
                .map_err(|e| {
                    RegistryProtocolError::MalformedManifest(format!(
                        "history entry {position}: {e}"
                    ))
                })?;

            let id = v1.id.filter(|id| !id.is_empty()).ok_or_else(|| {
                RegistryProtocolError::InvalidLayerGraph(format!(
                    "history entry {position} has no id"
                ))
            })?;
            let parent = v1.parent.filter(|p| !p.is_empty());

            if !seen.insert((parent.clone(), id.clone())) {
                tracing::debug!(%id, "skipping repeated history entry");
                continue;
            }

            let index = nodes.len();
            match &parent {
                None => {
                    if let Some(existing) = root {
                        return Err(RegistryProtocolError::InvalidLayerGraph(format!(
                            "layers {} and {id} both have no parent",
                            nodes[existing].id
                        ))
                        .into());
                    }
                    root = Some(index);
                }
                Some(parent) => {
                    if let Some(&existing) = by_parent.get(parent) {
                        return Err(RegistryProtocolError::InvalidLayerGraph(format!(
                            "parent {parent} is claimed by {} and {id}",
                            nodes[existing].id
                        ))
                        .into());
                    }
                    by_parent.insert(parent.clone(), index);
                }
            }

            let config = v1.config;
            nodes.push(LayerNode {
                id,
                parent,
                blob_digest: layer.blob_sum.clone(),
                env: config
                    .as_ref()
                    .and_then(|c| c.env.clone())
                    .unwrap_or_default(),
                entrypoint: config.as_ref().and_then(|c| match &c.entrypoint {
                    Some(StringOrList::One(one)) => Some(vec![one.clone()]),
                    Some(StringOrList::Many(many)) => Some(many.clone()),
                    None => None,
                }),
                workdir: config
                    .as_ref()
                    .and_then(|c| c.working_dir.clone())
                    .filter(|w| !w.is_empty()),
                labels: config.and_then(|c| c.labels).unwrap_or_default(),
                child: None,
            });
        }

        let root = root.ok_or_else(|| {
            RegistryProtocolError::InvalidLayerGraph("no layer without a parent".to_string())
        })?;

        let mut chain = vec![root];
        let mut visited = HashSet::from([nodes[root].id.clone()]);
        let mut current = root;

        while let Some(&next) = by_parent.get(&nodes[current].id) {
            if !visited.insert(nodes[next].id.clone()) || chain.len() >= nodes.len() {
                return Err(RegistryProtocolError::InvalidLayerGraph(format!(
                    "layer {} closes a cycle",
                    nodes[next].id
                ))
                .into());
            }

            nodes[current].child = Some(next);
            chain.push(next);
            current = next;
        }

        if chain.len() < nodes.len() {
            tracing::warn!(
                unreachable = nodes.len() - chain.len(),
                "ignoring history entries that are not reachable from the base layer"
            );
        }

        Ok(Self { nodes, chain })
    }

    /// Returns the base layer.
    pub fn root(&self) -> &LayerNode {
        &self.nodes[self.chain[0]]
    }

    /// Returns the topmost layer.
    pub fn leaf(&self) -> &LayerNode {
        &self.nodes[self.chain[self.chain.len() - 1]]
    }

    /// Iterates the chain from the base layer to the topmost one.
    pub fn chain(&self) -> impl Iterator<Item = &LayerNode> {
        self.chain.iter().map(|&index| &self.nodes[index])
    }

    /// Returns the number of layers in the chain.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Returns true if the chain is empty, which a built graph never is.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Returns the image metadata, taken from the topmost layer.
    pub fn image_metadata(&self) -> ImageMetadata {
        let leaf = self.leaf();
        ImageMetadata {
            id: leaf.id.clone(),
            env: leaf.env.clone(),
            entrypoint: leaf.entrypoint.clone(),
            workdir: leaf.workdir.clone(),
            labels: leaf.labels.clone(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

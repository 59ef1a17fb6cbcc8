//! Ownership forest construction: turns the flat list of collected objects
//! into trees following `metadata.ownerReferences`.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Kinds whose nodes are shipped even without children. Everything else is
/// dropped from the upload when childless.
pub const ALWAYS_SEND_CHILDLESS: &[&str] = &["Ingress", "Provisioner"];

/// One node of the ownership forest. `children` nests owned objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectsTree {
    pub name: String,
    pub kind: String,
    pub uid: String,
    #[serde(default)]
    pub children: Vec<ObjectsTree>,
}

impl ObjectsTree {
    /// Whether the node should be uploaded. Childless nodes are noise for
    /// ownership analysis unless their kind is on the allow-list.
    pub fn should_send(&self) -> bool {
        !self.children.is_empty() || ALWAYS_SEND_CHILDLESS.contains(&self.kind.as_str())
    }
}

#[derive(Debug, Clone)]
struct FlatNode {
    name: String,
    kind: String,
    uid: String,
    owners: Vec<String>,
}

/// Build the ownership forest for a flat object list. Objects without a
/// usable `metadata.uid` are skipped; owner references pointing outside the
/// collected set make their child a root. Output order follows input order
/// of the root objects; children keep input order too.
pub fn build_forest(objects: &[serde_json::Value]) -> Vec<ObjectsTree> {
    let mut nodes: Vec<FlatNode> = Vec::with_capacity(objects.len());
    for obj in objects {
        let meta = match obj.get("metadata") {
            Some(m) => m,
            None => continue,
        };
        let uid = match meta.get("uid").and_then(|u| u.as_str()) {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => continue,
        };
        let name = meta.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
        let kind = obj.get("kind").and_then(|k| k.as_str()).unwrap_or_default().to_string();
        let owners = meta
            .get("ownerReferences")
            .and_then(|o| o.as_array())
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| r.get("uid").and_then(|u| u.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        nodes.push(FlatNode { name, kind, uid, owners });
    }

    let known: BTreeSet<&str> = nodes.iter().map(|n| n.uid.as_str()).collect();
    let mut children_of: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut roots: Vec<usize> = Vec::new();
    for (idx, node) in nodes.iter().enumerate() {
        // First collected owner wins; an object is attached once.
        match node.owners.iter().find(|uid| known.contains(uid.as_str())) {
            Some(owner) => children_of.entry(owner.as_str()).or_default().push(idx),
            None => roots.push(idx),
        }
    }

    let forest: Vec<ObjectsTree> =
        roots.iter().map(|&idx| assemble(idx, &nodes, &children_of)).collect();
    debug!(objects = objects.len(), roots = forest.len(), "ownership forest built");
    forest
}

fn assemble(
    idx: usize,
    nodes: &[FlatNode],
    children_of: &BTreeMap<&str, Vec<usize>>,
) -> ObjectsTree {
    let node = &nodes[idx];
    let children = children_of
        .get(node.uid.as_str())
        .map(|ids| ids.iter().map(|&c| assemble(c, nodes, children_of)).collect())
        .unwrap_or_default();
    ObjectsTree {
        name: node.name.clone(),
        kind: node.kind.clone(),
        uid: node.uid.clone(),
        children,
    }
}

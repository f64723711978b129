//! Boot-image load chains. A chain is a DAG whose roots are the images the
//! firmware loads directly and whose edges are chain-load relationships.
//! Shared tail nodes (diamonds) are expected, so nodes live in an arena and
//! are referenced by index.

use std::path::PathBuf;

use diskseal_api::error::{InternalError, SealError};

/// Who measures the image when it runs: the firmware itself or the shim
/// first-stage loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Firmware,
    Shim,
}

/// Where the image bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// A file on the local filesystem.
    Path(PathBuf),
    /// A member file inside a snap container image.
    Container { container: PathBuf, member: String },
}

/// Index of a node inside its [`LoadChain`] arena.
pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct LoadNode {
    pub source: ImageSource,
    pub image: ImageRef,
    children: Vec<NodeId>,
}

/// A load-chain DAG. Built incrementally; path enumeration rejects cycles.
#[derive(Debug, Clone, Default)]
pub struct LoadChain {
    nodes: Vec<LoadNode>,
    roots: Vec<NodeId>,
}

impl LoadChain {
    pub fn new() -> Self {
        LoadChain::default()
    }

    pub fn add_node(&mut self, source: ImageSource, image: ImageRef) -> NodeId {
        self.nodes.push(LoadNode {
            source,
            image,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    pub fn add_root(&mut self, node: NodeId) {
        self.roots.push(node);
    }

    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent].children.push(child);
    }

    pub fn node(&self, id: NodeId) -> &LoadNode {
        &self.nodes[id]
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Enumerates every root-to-leaf path, depth first, with roots and
    /// children visited in the order they were supplied. A cycle is a
    /// construction bug and is rejected.
    pub fn sequences(&self) -> Result<Vec<Vec<NodeId>>, SealError> {
        let mut sequences = Vec::new();
        let mut path = Vec::new();
        let mut on_path = vec![false; self.nodes.len()];

        for &root in &self.roots {
            self.walk(root, &mut path, &mut on_path, &mut sequences)?;
        }
        Ok(sequences)
    }

    fn walk(
        &self,
        node: NodeId,
        path: &mut Vec<NodeId>,
        on_path: &mut [bool],
        sequences: &mut Vec<Vec<NodeId>>,
    ) -> Result<(), SealError> {
        if on_path[node] {
            return Err(SealError::new(InternalError::LoadChainCycle));
        }

        path.push(node);
        on_path[node] = true;

        if self.nodes[node].children.is_empty() {
            sequences.push(path.clone());
        } else {
            for &child in &self.nodes[node].children {
                self.walk(child, path, on_path, sequences)?;
            }
        }

        on_path[node] = false;
        path.pop();
        Ok(())
    }
}

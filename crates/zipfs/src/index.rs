//! The in-memory directory tree.
//!
//! Nodes live in an arena in insertion order, which is also the order the
//! sync engine writes them back in. Replacing the node for an existing name
//! reuses its slot, so an entry keeps its position across updates. Names are
//! the stored entry names: no leading separator, directories end with `/`,
//! and the root is the empty name.

use std::collections::HashMap;

use crate::entry::Entry;
use crate::reader::CentralDirectory;

pub(crate) type NodeId = usize;

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub name: Vec<u8>,
    /// Start of the node's central directory record; `None` for nodes that
    /// have no record in the archive.
    pub cen_pos: Option<usize>,
    /// Pending replacement for the archive's record.
    pub entry: Option<Entry>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl Node {
    fn new(name: Vec<u8>, cen_pos: Option<usize>, entry: Option<Entry>) -> Self {
        Self {
            name,
            cen_pos,
            entry,
            parent: None,
            children: Vec::new(),
        }
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.name.is_empty()
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.is_root() || self.name.ends_with(b"/")
    }

    /// Directory implied by a descendant's name, with no record or entry.
    #[inline]
    pub fn is_synthesized(&self) -> bool {
        self.cen_pos.is_none() && self.entry.is_none()
    }
}

/// Name of the directory containing `name`.
pub(crate) fn parent_of(name: &[u8]) -> &[u8] {
    let trimmed = name.strip_suffix(b"/").unwrap_or(name);
    match trimmed.iter().rposition(|&b| b == b'/') {
        Some(i) => &name[..=i],
        None => b"",
    }
}

/// Last component of `name`, without a trailing separator.
pub(crate) fn file_name(name: &[u8]) -> &[u8] {
    let trimmed = name.strip_suffix(b"/").unwrap_or(name);
    &trimmed[parent_of(name).len()..]
}

#[derive(Debug)]
pub(crate) struct DirectoryIndex {
    nodes: Vec<Option<Node>>,
    by_name: HashMap<Vec<u8>, NodeId>,
}

impl DirectoryIndex {
    /// Index holding only the root.
    pub fn new() -> Self {
        let mut index = Self {
            nodes: Vec::new(),
            by_name: HashMap::new(),
        };
        index.push(Node::new(Vec::new(), None, None));
        index
    }

    /// Build the tree for a central directory, synthesizing every ancestor
    /// directory that has no record of its own.
    pub fn build(directory: &CentralDirectory) -> Self {
        let mut index = Self::new();
        let mut linked = Vec::with_capacity(directory.records.len());
        for &pos in &directory.records {
            let name = directory.name_at(pos);
            if name.is_empty() || name == b"/" {
                tracing::trace!("ignoring root directory record");
                continue;
            }
            match index.by_name.get(name) {
                // duplicate names: the later record wins, in the first one's slot
                Some(&id) => {
                    if let Some(node) = index.nodes[id].as_mut() {
                        node.cen_pos = Some(pos);
                    }
                }
                None => linked.push(index.push(Node::new(name.to_vec(), Some(pos), None))),
            }
        }
        for id in linked {
            index.link(id);
        }
        index
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = self.nodes.len();
        self.by_name.insert(node.name.clone(), id);
        self.nodes.push(Some(node));
        id
    }

    /// Attach `id` to its parent, synthesizing missing ancestors.
    fn link(&mut self, id: NodeId) {
        let mut child = id;
        loop {
            let Some(node) = self.nodes[child].as_ref() else {
                return;
            };
            if node.is_root() {
                return;
            }
            let parent_name = parent_of(&node.name).to_vec();
            let (parent, synthesized) = match self.by_name.get(&parent_name) {
                Some(&parent) => (parent, false),
                None => (self.push(Node::new(parent_name, None, None)), true),
            };
            if let Some(node) = self.nodes[parent].as_mut() {
                node.children.push(child);
            }
            if let Some(node) = self.nodes[child].as_mut() {
                node.parent = Some(parent);
            }
            if !synthesized {
                return;
            }
            child = parent;
        }
    }

    #[cfg(test)]
    pub fn root(&self) -> NodeId {
        0
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id).and_then(Option::as_mut)
    }

    /// Look up a name, retrying as a directory name if the exact name is
    /// absent.
    pub fn find(&self, name: &[u8]) -> Option<NodeId> {
        if let Some(&id) = self.by_name.get(name) {
            return Some(id);
        }
        if name.ends_with(b"/") {
            return None;
        }
        let mut dir = Vec::with_capacity(name.len() + 1);
        dir.extend_from_slice(name);
        dir.push(b'/');
        self.by_name.get(&dir).copied()
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map_or(&[], |node| node.children.as_slice())
    }

    /// Make `entry` the authoritative node for its name.
    ///
    /// An existing node keeps its slot and children; its previous entry is
    /// returned. A new node is linked under its parent.
    pub fn insert(&mut self, entry: Entry) -> (NodeId, Option<Entry>) {
        if let Some(&id) = self.by_name.get(&entry.name) {
            if let Some(node) = self.nodes[id].as_mut() {
                node.cen_pos = None;
                return (id, node.entry.replace(entry));
            }
        }
        let id = self.push(Node::new(entry.name.clone(), None, Some(entry)));
        self.link(id);
        (id, None)
    }

    /// Remove a node and unlink it from its parent.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.get_mut(id)?.take()?;
        self.by_name.remove(&node.name);
        if let Some(parent) = node.parent.and_then(|p| self.get_mut(p)) {
            parent.children.retain(|&c| c != id);
        }
        Some(node)
    }

    /// Live nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(id, node)| node.as_ref().map(|node| (id, node)))
    }

    /// Number of live nodes, including the root.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}

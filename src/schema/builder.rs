use crate::schema::model::{LeafType, ModuleSchema, NodeKind, SchemaNode, SchemaNodeId, Submodule};
use std::path::PathBuf;

/// Programmatic construction of a [`ModuleSchema`].
///
/// Schema loaders (YANG/YIN parsing is a collaborator concern) translate
/// their parse results through this builder; tests use it directly.
pub struct SchemaBuilder {
    name: String,
    revision: Option<String>,
    namespace: String,
    prefix: String,
    filepath: Option<PathBuf>,
    submodules: Vec<Submodule>,
    nodes: Vec<SchemaNode>,
    roots: Vec<SchemaNodeId>,
}

impl SchemaBuilder {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            revision: None,
            namespace: namespace.into(),
            prefix: prefix.into(),
            filepath: None,
            submodules: Vec::new(),
            nodes: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn filepath(mut self, path: impl Into<PathBuf>) -> Self {
        self.filepath = Some(path.into());
        self
    }

    pub fn submodule(mut self, name: impl Into<String>, revision: Option<String>) -> Self {
        self.submodules.push(Submodule {
            name: name.into(),
            revision,
        });
        self
    }

    fn push(&mut self, parent: Option<SchemaNodeId>, name: &str, kind: NodeKind) -> SchemaNodeId {
        let id = self.nodes.len();
        self.nodes.push(SchemaNode {
            name: name.to_string(),
            kind,
            config: true,
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(parent_id) => self.nodes[parent_id].children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn container(&mut self, parent: Option<SchemaNodeId>, name: &str) -> SchemaNodeId {
        self.push(parent, name, NodeKind::Container { presence: false })
    }

    pub fn presence_container(&mut self, parent: Option<SchemaNodeId>, name: &str) -> SchemaNodeId {
        self.push(parent, name, NodeKind::Container { presence: true })
    }

    pub fn list(&mut self, parent: Option<SchemaNodeId>, name: &str, keys: &[&str]) -> SchemaNodeId {
        self.push(
            parent,
            name,
            NodeKind::List {
                keys: keys.iter().map(|k| k.to_string()).collect(),
                user_ordered: false,
            },
        )
    }

    /// A list with `ordered-by user` semantics (move targets).
    pub fn user_list(
        &mut self,
        parent: Option<SchemaNodeId>,
        name: &str,
        keys: &[&str],
    ) -> SchemaNodeId {
        self.push(
            parent,
            name,
            NodeKind::List {
                keys: keys.iter().map(|k| k.to_string()).collect(),
                user_ordered: true,
            },
        )
    }

    pub fn leaf(&mut self, parent: Option<SchemaNodeId>, name: &str, ty: LeafType) -> SchemaNodeId {
        self.push(
            parent,
            name,
            NodeKind::Leaf {
                ty,
                default: None,
                mandatory: false,
            },
        )
    }

    pub fn leaf_with_default(
        &mut self,
        parent: Option<SchemaNodeId>,
        name: &str,
        ty: LeafType,
        default: &str,
    ) -> SchemaNodeId {
        self.push(
            parent,
            name,
            NodeKind::Leaf {
                ty,
                default: Some(default.to_string()),
                mandatory: false,
            },
        )
    }

    pub fn mandatory_leaf(
        &mut self,
        parent: Option<SchemaNodeId>,
        name: &str,
        ty: LeafType,
    ) -> SchemaNodeId {
        self.push(
            parent,
            name,
            NodeKind::Leaf {
                ty,
                default: None,
                mandatory: true,
            },
        )
    }

    pub fn leaf_list(
        &mut self,
        parent: Option<SchemaNodeId>,
        name: &str,
        ty: LeafType,
    ) -> SchemaNodeId {
        self.push(
            parent,
            name,
            NodeKind::LeafList {
                ty,
                user_ordered: false,
            },
        )
    }

    pub fn user_leaf_list(
        &mut self,
        parent: Option<SchemaNodeId>,
        name: &str,
        ty: LeafType,
    ) -> SchemaNodeId {
        self.push(
            parent,
            name,
            NodeKind::LeafList {
                ty,
                user_ordered: true,
            },
        )
    }

    /// Top-level RPC; returns (rpc, input, output) ids.
    pub fn rpc(&mut self, name: &str) -> (SchemaNodeId, SchemaNodeId, SchemaNodeId) {
        let rpc = self.push(None, name, NodeKind::Rpc);
        let input = self.push(Some(rpc), "input", NodeKind::Input);
        let output = self.push(Some(rpc), "output", NodeKind::Output);
        (rpc, input, output)
    }

    /// Action nested in the data tree; returns (action, input, output) ids.
    pub fn action(
        &mut self,
        parent: SchemaNodeId,
        name: &str,
    ) -> (SchemaNodeId, SchemaNodeId, SchemaNodeId) {
        let action = self.push(Some(parent), name, NodeKind::Action);
        let input = self.push(Some(action), "input", NodeKind::Input);
        let output = self.push(Some(action), "output", NodeKind::Output);
        (action, input, output)
    }

    /// Event notification, top-level or nested in the data tree.
    pub fn notification(&mut self, parent: Option<SchemaNodeId>, name: &str) -> SchemaNodeId {
        self.push(parent, name, NodeKind::Notification)
    }

    /// Mark a node as `config false`; descendants inherit at `build`.
    pub fn mark_state(&mut self, id: SchemaNodeId) {
        self.nodes[id].config = false;
    }

    pub fn build(mut self) -> ModuleSchema {
        // config=false inherits downward; ids are in insertion order so a
        // single forward pass sees parents before children.
        for id in 0..self.nodes.len() {
            if let Some(parent) = self.nodes[id].parent {
                if !self.nodes[parent].config {
                    self.nodes[id].config = false;
                }
            }
        }
        ModuleSchema::from_parts(
            self.name,
            self.revision,
            self.namespace,
            self.prefix,
            self.filepath,
            self.submodules,
            self.nodes,
            self.roots,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_false_inherits() {
        let mut b = SchemaBuilder::new("m", "urn:m", "m");
        let state = b.container(None, "state");
        b.mark_state(state);
        let inner = b.container(Some(state), "inner");
        b.leaf(Some(inner), "leaf", LeafType::String);
        let schema = b.build();

        let leaf = schema.find_path(&["state", "inner", "leaf"]).unwrap();
        assert!(!schema.node(leaf).config);
    }

    #[test]
    fn rpc_carries_input_and_output() {
        let mut b = SchemaBuilder::new("m", "urn:m", "m");
        let (rpc, input, output) = b.rpc("do-thing");
        b.leaf(Some(input), "arg", LeafType::String);
        let schema = b.build();

        assert_eq!(schema.node(rpc).children, vec![input, output]);
        assert!(schema.find_path(&["do-thing", "input", "arg"]).is_some());
    }
}

use crate::core::Value;
use crate::schema::{ModuleSchema, NodeKind, SchemaNodeId};

pub type DataNodeId = usize;

#[derive(Debug, Clone)]
pub struct DataNode {
    pub schema: SchemaNodeId,
    pub name: String,
    /// Leaf/leaf-list payload; interior nodes carry none.
    pub value: Option<Value>,
    /// Materialized from a schema default rather than set by a client.
    pub default: bool,
    pub parent: Option<DataNodeId>,
    pub children: Vec<DataNodeId>,
}

/// One module's data tree.
///
/// Nodes live in a slot arena addressed by index; removal tombstones the
/// slot, deep copy compacts. Child order is significant for user-ordered
/// lists and leaf-lists.
#[derive(Debug, Clone)]
pub struct DataTree {
    pub module: String,
    slots: Vec<Option<DataNode>>,
    roots: Vec<DataNodeId>,
}

impl DataTree {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            slots: Vec::new(),
            roots: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Live node count (tombstones excluded).
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn node(&self, id: DataNodeId) -> &DataNode {
        self.slots[id]
            .as_ref()
            .expect("data node id refers to a removed slot")
    }

    pub fn node_mut(&mut self, id: DataNodeId) -> &mut DataNode {
        self.slots[id]
            .as_mut()
            .expect("data node id refers to a removed slot")
    }

    pub fn roots(&self) -> &[DataNodeId] {
        &self.roots
    }

    /// Children of `parent`, or the top-level nodes when `parent` is None.
    pub fn children(&self, parent: Option<DataNodeId>) -> &[DataNodeId] {
        match parent {
            Some(id) => &self.node(id).children,
            None => &self.roots,
        }
    }

    pub fn add_node(
        &mut self,
        parent: Option<DataNodeId>,
        schema: SchemaNodeId,
        name: impl Into<String>,
        value: Option<Value>,
        default: bool,
    ) -> DataNodeId {
        let id = self.slots.len();
        self.slots.push(Some(DataNode {
            schema,
            name: name.into(),
            value,
            default,
            parent,
            children: Vec::new(),
        }));
        match parent {
            Some(parent_id) => self.node_mut(parent_id).children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    /// Pre-order ids of the subtree rooted at `id`, root included.
    pub fn subtree_ids(&self, id: DataNodeId) -> Vec<DataNodeId> {
        let mut ids = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            ids.push(current);
            // reversed so pre-order pops left-to-right
            for &child in self.node(current).children.iter().rev() {
                stack.push(child);
            }
        }
        ids
    }

    pub fn remove_subtree(&mut self, id: DataNodeId) {
        let parent = self.node(id).parent;
        match parent {
            Some(parent_id) => self.node_mut(parent_id).children.retain(|&c| c != id),
            None => self.roots.retain(|&r| r != id),
        }
        for dead in self.subtree_ids(id) {
            self.slots[dead] = None;
        }
    }

    /// Children of `parent` carrying the given name, in sibling order.
    pub fn children_named(&self, parent: Option<DataNodeId>, name: &str) -> Vec<DataNodeId> {
        self.children(parent)
            .iter()
            .copied()
            .filter(|&id| self.node(id).name == name)
            .collect()
    }

    /// Key leaf values of a list instance, in schema key order.
    pub fn list_key_values(&self, id: DataNodeId, schema: &ModuleSchema) -> Vec<(String, String)> {
        let NodeKind::List { keys, .. } = &schema.node(self.node(id).schema).kind else {
            return Vec::new();
        };
        keys.iter()
            .map(|key| {
                let value = self
                    .children_named(Some(id), key)
                    .first()
                    .and_then(|&leaf| self.node(leaf).value.as_ref())
                    .and_then(|v| v.lexical())
                    .unwrap_or_default();
                (key.clone(), value)
            })
            .collect()
    }

    /// Data path of a node with key/value predicates:
    /// `/module:container/list[key='a']/leaf`, `/module:options[.='v']`.
    pub fn path_of(&self, id: DataNodeId, schema: &ModuleSchema) -> String {
        let mut segments = Vec::new();
        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            let node = self.node(node_id);
            let mut segment = node.name.clone();
            match &schema.node(node.schema).kind {
                NodeKind::List { .. } => {
                    for (key, value) in self.list_key_values(node_id, schema) {
                        segment.push_str(&format!("[{}='{}']", key, value));
                    }
                }
                NodeKind::LeafList { .. } => {
                    if let Some(value) = node.value.as_ref().and_then(|v| v.lexical()) {
                        segment.push_str(&format!("[.='{}']", value));
                    }
                }
                _ => {}
            }
            segments.push(segment);
            cursor = node.parent;
        }
        segments.reverse();
        format!("/{}:{}", self.module, segments.join("/"))
    }

    /// Structural deep copy with compacted slots.
    pub fn deep_copy(&self) -> DataTree {
        let mut copy = DataTree::new(self.module.clone());
        for &root in &self.roots {
            self.copy_into(root, None, &mut copy);
        }
        copy
    }

    fn copy_into(&self, id: DataNodeId, new_parent: Option<DataNodeId>, target: &mut DataTree) {
        let node = self.node(id);
        let new_id = target.add_node(
            new_parent,
            node.schema,
            node.name.clone(),
            node.value.clone(),
            node.default,
        );
        for &child in &node.children {
            self.copy_into(child, Some(new_id), target);
        }
    }

    /// Reposition `id` among its same-schema siblings. `anchor` is required
    /// for Before/After and ignored otherwise.
    pub fn reorder(
        &mut self,
        id: DataNodeId,
        position: crate::core::MovePosition,
        anchor: Option<DataNodeId>,
    ) {
        use crate::core::MovePosition;

        let parent = self.node(id).parent;
        let schema = self.node(id).schema;

        let siblings: Vec<DataNodeId> = match parent {
            Some(p) => self.node(p).children.clone(),
            None => self.roots.clone(),
        };
        let mut remaining: Vec<DataNodeId> = siblings.iter().copied().filter(|&s| s != id).collect();

        let insert_at = match position {
            MovePosition::First => remaining
                .iter()
                .position(|&s| self.node(s).schema == schema)
                .unwrap_or(remaining.len()),
            MovePosition::Last => remaining
                .iter()
                .rposition(|&s| self.node(s).schema == schema)
                .map(|p| p + 1)
                .unwrap_or(remaining.len()),
            MovePosition::Before => anchor
                .and_then(|a| remaining.iter().position(|&s| s == a))
                .unwrap_or(remaining.len()),
            MovePosition::After => anchor
                .and_then(|a| remaining.iter().position(|&s| s == a).map(|p| p + 1))
                .unwrap_or(remaining.len()),
        };
        remaining.insert(insert_at, id);

        match parent {
            Some(p) => self.node_mut(p).children = remaining,
            None => self.roots = remaining,
        }
    }
}

use crate::core::{ChangeOper, TypedValue, Value};
use crate::schema::{ModuleSchema, NodeKind, SchemaNodeId};
use crate::tree::node::{DataNodeId, DataTree};

/// One element of a per-module change list.
///
/// Created/Deleted entries stand for a whole subtree; `subtree_schemas`
/// records every schema node occurring in it so subscription matching can
/// descend without keeping the tree around.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub oper: ChangeOper,
    pub xpath: String,
    pub schema: SchemaNodeId,
    pub old_value: Option<TypedValue>,
    pub new_value: Option<TypedValue>,
    pub subtree_schemas: Vec<SchemaNodeId>,
}

/// Compare the previous tree with the post-commit tree.
pub fn diff_trees(schema: &ModuleSchema, old: &DataTree, new: &DataTree) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    diff_children(schema, old, None, new, None, &mut entries);
    entries
}

fn typed_value(tree: &DataTree, schema: &ModuleSchema, id: DataNodeId) -> TypedValue {
    let node = tree.node(id);
    let value = match &node.value {
        Some(value) => value.clone(),
        None => match &schema.node(node.schema).kind {
            NodeKind::Container { presence: true } => Value::PresenceContainer,
            NodeKind::Container { presence: false } => Value::Container,
            _ => Value::List,
        },
    };
    TypedValue {
        xpath: tree.path_of(id, schema),
        origin_default: node.default,
        value,
    }
}

/// Identity of a node among its siblings: schema id plus, for lists, the key
/// tuple, and for leaf-lists, the value.
fn identity(tree: &DataTree, schema: &ModuleSchema, id: DataNodeId) -> (SchemaNodeId, String) {
    let node = tree.node(id);
    let discriminator = match &schema.node(node.schema).kind {
        NodeKind::List { .. } => tree
            .list_key_values(id, schema)
            .into_iter()
            .map(|(_, v)| v)
            .collect::<Vec<_>>()
            .join("\u{0}"),
        NodeKind::LeafList { .. } => node
            .value
            .as_ref()
            .and_then(|v| v.lexical())
            .unwrap_or_default(),
        _ => String::new(),
    };
    (node.schema, discriminator)
}

fn subtree_schemas(tree: &DataTree, id: DataNodeId) -> Vec<SchemaNodeId> {
    let mut schemas: Vec<SchemaNodeId> = tree
        .subtree_ids(id)
        .into_iter()
        .map(|node_id| tree.node(node_id).schema)
        .collect();
    schemas.sort_unstable();
    schemas.dedup();
    schemas
}

fn diff_children(
    schema: &ModuleSchema,
    old: &DataTree,
    old_parent: Option<DataNodeId>,
    new: &DataTree,
    new_parent: Option<DataNodeId>,
    entries: &mut Vec<DiffEntry>,
) {
    let old_ids = old.children(old_parent).to_vec();
    let new_ids = new.children(new_parent).to_vec();

    let new_identities: Vec<(SchemaNodeId, String)> = new_ids
        .iter()
        .map(|&id| identity(new, schema, id))
        .collect();
    let mut new_matched = vec![false; new_ids.len()];
    let mut pairs: Vec<(DataNodeId, DataNodeId)> = Vec::new();

    for &old_id in &old_ids {
        let old_identity = identity(old, schema, old_id);
        let matched = new_identities
            .iter()
            .enumerate()
            .find(|(index, candidate)| !new_matched[*index] && **candidate == old_identity);
        match matched {
            Some((index, _)) => {
                new_matched[index] = true;
                pairs.push((old_id, new_ids[index]));
            }
            None => entries.push(DiffEntry {
                oper: ChangeOper::Deleted,
                xpath: old.path_of(old_id, schema),
                schema: old.node(old_id).schema,
                old_value: Some(typed_value(old, schema, old_id)),
                new_value: None,
                subtree_schemas: subtree_schemas(old, old_id),
            }),
        }
    }

    for (index, &new_id) in new_ids.iter().enumerate() {
        if !new_matched[index] {
            entries.push(DiffEntry {
                oper: ChangeOper::Created,
                xpath: new.path_of(new_id, schema),
                schema: new.node(new_id).schema,
                old_value: None,
                new_value: Some(typed_value(new, schema, new_id)),
                subtree_schemas: subtree_schemas(new, new_id),
            });
        }
    }

    // value changes + recursion
    for &(old_id, new_id) in &pairs {
        let old_node = old.node(old_id);
        let new_node = new.node(new_id);
        match &schema.node(new_node.schema).kind {
            NodeKind::Leaf { .. } => {
                if old_node.value != new_node.value {
                    entries.push(DiffEntry {
                        oper: ChangeOper::Modified,
                        xpath: new.path_of(new_id, schema),
                        schema: new_node.schema,
                        old_value: Some(typed_value(old, schema, old_id)),
                        new_value: Some(typed_value(new, schema, new_id)),
                        subtree_schemas: vec![new_node.schema],
                    });
                }
            }
            NodeKind::Container { .. } | NodeKind::List { .. } => {
                diff_children(schema, old, Some(old_id), new, Some(new_id), entries);
            }
            // leaf-list identity covers the value, nothing to compare
            _ => {}
        }
    }

    detect_moves(schema, old, &old_ids, new, &pairs, entries);
}

/// For user-ordered schemas, flag matched instances whose relative order
/// changed. The scan keeps a running maximum of old sibling indices; any
/// instance arriving below it was reordered.
fn detect_moves(
    schema: &ModuleSchema,
    old: &DataTree,
    old_ids: &[DataNodeId],
    new: &DataTree,
    pairs: &[(DataNodeId, DataNodeId)],
    entries: &mut Vec<DiffEntry>,
) {
    use std::collections::HashMap;

    let mut by_schema: HashMap<SchemaNodeId, Vec<(DataNodeId, DataNodeId)>> = HashMap::new();
    for &(old_id, new_id) in pairs {
        let sid = new.node(new_id).schema;
        let user_ordered = match &schema.node(sid).kind {
            NodeKind::List { user_ordered, .. } => *user_ordered,
            NodeKind::LeafList { user_ordered, .. } => *user_ordered,
            _ => false,
        };
        if user_ordered {
            by_schema.entry(sid).or_default().push((old_id, new_id));
        }
    }

    for (sid, mut instances) in by_schema {
        // old sibling index per matched instance
        let old_positions: HashMap<DataNodeId, usize> = old_ids
            .iter()
            .filter(|&&id| old.node(id).schema == sid)
            .enumerate()
            .map(|(index, &id)| (id, index))
            .collect();
        // pairs arrive in old order; replay them in new sibling order
        instances.sort_by_key(|&(_, new_id)| {
            new.children(new.node(new_id).parent)
                .iter()
                .position(|&c| c == new_id)
                .unwrap_or(usize::MAX)
        });

        let mut running_max: Option<usize> = None;
        for (old_id, new_id) in instances {
            let old_pos = old_positions[&old_id];
            match running_max {
                Some(max) if old_pos < max => entries.push(DiffEntry {
                    oper: ChangeOper::Moved,
                    xpath: new.path_of(new_id, schema),
                    schema: sid,
                    old_value: Some(typed_value(old, schema, old_id)),
                    new_value: Some(typed_value(new, schema, new_id)),
                    subtree_schemas: vec![sid],
                }),
                _ => running_max = Some(old_pos),
            }
        }
    }
}

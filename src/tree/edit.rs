use crate::core::{DbError, EditFlags, MovePosition, Result, Value};
use crate::schema::{LeafType, ModuleSchema, NodeKind, SchemaNodeId};
use crate::tree::node::{DataNodeId, DataTree};
use crate::tree::xpath::{Step, XPath, step_matches};

/// Set a node's value, creating it (and, by default, its ancestors) as
/// needed.
///
/// * `strict`: the node must not exist yet, otherwise DataExists.
/// * `non_recursive`: all ancestors must already exist (DataMissing).
/// * leaf-lists: an `[.='v']` predicate takes precedence over `value`.
pub fn apply_set(
    tree: &mut DataTree,
    schema: &ModuleSchema,
    xpath: &XPath,
    value: Option<&Value>,
    flags: EditFlags,
) -> Result<()> {
    apply_set_with_origin(tree, schema, xpath, value, flags, false)
}

/// `apply_set` variant used when merging provider data, which may carry the
/// default-origin marker.
pub fn apply_set_with_origin(
    tree: &mut DataTree,
    schema: &ModuleSchema,
    xpath: &XPath,
    value: Option<&Value>,
    flags: EditFlags,
    origin_default: bool,
) -> Result<()> {
    let target_schema = xpath.resolve_schema(schema)?;

    // Walk (or create) the ancestor chain.
    let mut data_parent: Option<DataNodeId> = None;
    let mut schema_parent: Option<SchemaNodeId> = None;
    for step in &xpath.steps[..xpath.steps.len() - 1] {
        let step_schema = schema
            .find_child(schema_parent, &step.name)
            .ok_or_else(|| DbError::BadElement(format!("unknown schema node '{}'", step.name)))?;
        let existing = find_step_instance(tree, schema, data_parent, step)?;
        let node = match existing {
            Some(id) => id,
            None => {
                if flags.non_recursive {
                    return Err(DbError::DataMissing(format!(
                        "ancestor '{}' does not exist",
                        step.name
                    )));
                }
                create_interior(tree, schema, data_parent, step_schema, step)?
            }
        };
        data_parent = Some(node);
        schema_parent = Some(step_schema);
    }

    let last = &xpath.steps[xpath.steps.len() - 1];
    match &schema.node(target_schema).kind {
        NodeKind::Leaf { ty, .. } => {
            let value = coerce_leaf_value(ty, value, None, xpath)?;
            let existing = tree.children_named(data_parent, &last.name);
            if let Some(&leaf) = existing.first() {
                if flags.strict {
                    return Err(DbError::DataExists(format!("node '{}' exists", xpath)));
                }
                let node = tree.node_mut(leaf);
                node.value = Some(value);
                node.default = origin_default;
            } else {
                tree.add_node(
                    data_parent,
                    target_schema,
                    last.name.clone(),
                    Some(value),
                    origin_default,
                );
            }
        }
        NodeKind::LeafList { ty, .. } => {
            let value = coerce_leaf_value(ty, value, last.value_predicate.as_deref(), xpath)?;
            let lexical = value.lexical();
            let duplicate = tree
                .children_named(data_parent, &last.name)
                .into_iter()
                .any(|id| {
                    tree.node(id).value.as_ref().and_then(|v| v.lexical()) == lexical
                });
            if duplicate {
                if flags.strict {
                    return Err(DbError::DataExists(format!("node '{}' exists", xpath)));
                }
                return Ok(());
            }
            tree.add_node(
                data_parent,
                target_schema,
                last.name.clone(),
                Some(value),
                origin_default,
            );
        }
        NodeKind::Container { .. } | NodeKind::List { .. } => {
            match find_step_instance(tree, schema, data_parent, last)? {
                Some(_) if flags.strict => {
                    return Err(DbError::DataExists(format!("node '{}' exists", xpath)));
                }
                Some(_) => {}
                None => {
                    create_interior(tree, schema, data_parent, target_schema, last)?;
                }
            }
        }
        other => {
            return Err(DbError::InvalidArg(format!(
                "cannot set a {:?} node",
                other
            )));
        }
    }

    // ancestors of explicit content are no longer default-only
    let mut cursor = data_parent;
    while let Some(id) = cursor {
        let node = tree.node_mut(id);
        node.default = false;
        cursor = node.parent;
    }
    Ok(())
}

/// Delete the denoted node(s). Without key predicates a list step addresses
/// every instance.
pub fn apply_delete(
    tree: &mut DataTree,
    schema: &ModuleSchema,
    xpath: &XPath,
    flags: EditFlags,
) -> Result<()> {
    let target_schema = xpath.resolve_schema(schema)?;
    let matches = xpath.find(tree, schema)?;
    if matches.is_empty() {
        if flags.strict {
            return Err(DbError::DataMissing(format!(
                "node '{}' does not exist",
                xpath
            )));
        }
        return Ok(());
    }

    if flags.non_recursive {
        let keys: &[String] = match &schema.node(target_schema).kind {
            NodeKind::List { keys, .. } => keys,
            _ => &[],
        };
        for &id in &matches {
            let non_key_children = tree
                .node(id)
                .children
                .iter()
                .filter(|&&c| !keys.contains(&tree.node(c).name))
                .count();
            if non_key_children > 0 {
                return Err(DbError::OperationFailed(format!(
                    "node '{}' is not empty",
                    tree.path_of(id, schema)
                )));
            }
        }
    }

    for id in matches {
        tree.remove_subtree(id);
    }
    Ok(())
}

/// Reposition a user-ordered list instance or leaf-list entry.
pub fn apply_move(
    tree: &mut DataTree,
    schema: &ModuleSchema,
    xpath: &XPath,
    position: MovePosition,
    relative: Option<&XPath>,
) -> Result<()> {
    let target_schema = xpath.resolve_schema(schema)?;
    let user_ordered = match &schema.node(target_schema).kind {
        NodeKind::List { user_ordered, .. } => *user_ordered,
        NodeKind::LeafList { user_ordered, .. } => *user_ordered,
        _ => false,
    };
    if !user_ordered {
        return Err(DbError::InvalidArg(format!(
            "node '{}' is not user-ordered",
            xpath
        )));
    }

    let matches = xpath.find(tree, schema)?;
    let &node = match matches.as_slice() {
        [] => {
            return Err(DbError::DataMissing(format!(
                "node '{}' does not exist",
                xpath
            )));
        }
        [single] => single,
        _ => {
            return Err(DbError::InvalidArg(format!(
                "xpath '{}' is ambiguous",
                xpath
            )));
        }
    };

    let anchor = match position {
        MovePosition::Before | MovePosition::After => {
            let relative = relative.ok_or_else(|| {
                DbError::InvalidArg("relative xpath required for BEFORE/AFTER".to_string())
            })?;
            let anchors = relative.find(tree, schema)?;
            let &anchor = anchors.first().ok_or_else(|| {
                DbError::DataMissing(format!("relative node '{}' does not exist", relative))
            })?;
            if tree.node(anchor).schema != tree.node(node).schema
                || tree.node(anchor).parent != tree.node(node).parent
            {
                return Err(DbError::InvalidArg(
                    "relative node is not a sibling instance".to_string(),
                ));
            }
            Some(anchor)
        }
        _ => None,
    };

    tree.reorder(node, position, anchor);
    Ok(())
}

/// Locate the single data node a path step denotes under `parent`.
/// Errors when a keyless step over a populated list is ambiguous.
fn find_step_instance(
    tree: &DataTree,
    schema: &ModuleSchema,
    parent: Option<DataNodeId>,
    step: &Step,
) -> Result<Option<DataNodeId>> {
    let candidates: Vec<DataNodeId> = tree
        .children_named(parent, &step.name)
        .into_iter()
        .filter(|&id| step_matches(tree, schema, id, step))
        .collect();
    match candidates.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some(*one)),
        _ => Err(DbError::InvalidArg(format!(
            "step '{}' matches several instances",
            step.name
        ))),
    }
}

/// Create a container or list instance for the given step; list instances
/// get their key leaves from the step predicates.
fn create_interior(
    tree: &mut DataTree,
    schema: &ModuleSchema,
    parent: Option<DataNodeId>,
    node_schema: SchemaNodeId,
    step: &Step,
) -> Result<DataNodeId> {
    match &schema.node(node_schema).kind {
        NodeKind::Container { .. } => {
            Ok(tree.add_node(parent, node_schema, step.name.clone(), None, false))
        }
        NodeKind::List { keys, .. } => {
            // every key must come from a predicate
            let mut key_values = Vec::with_capacity(keys.len());
            for key in keys {
                let value = step
                    .keys
                    .iter()
                    .find(|(name, _)| name == key)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| {
                        DbError::InvalidArg(format!(
                            "list '{}' requires key predicate '{}'",
                            step.name, key
                        ))
                    })?;
                key_values.push((key.clone(), value));
            }
            let instance = tree.add_node(parent, node_schema, step.name.clone(), None, false);
            for (key, lexical) in key_values {
                let key_schema = schema.find_child(Some(node_schema), &key).ok_or_else(|| {
                    DbError::BadElement(format!("list '{}' has no key leaf '{}'", step.name, key))
                })?;
                let ty = match &schema.node(key_schema).kind {
                    NodeKind::Leaf { ty, .. } => ty,
                    _ => {
                        return Err(DbError::BadElement(format!(
                            "key '{}' of list '{}' is not a leaf",
                            key, step.name
                        )));
                    }
                };
                let value = ty.parse(&lexical)?;
                tree.add_node(Some(instance), key_schema, key, Some(value), false);
            }
            Ok(instance)
        }
        other => Err(DbError::InvalidArg(format!(
            "cannot create interior node of kind {:?}",
            other
        ))),
    }
}

fn coerce_leaf_value(
    ty: &LeafType,
    value: Option<&Value>,
    predicate: Option<&str>,
    xpath: &XPath,
) -> Result<Value> {
    if let Some(lexical) = predicate {
        return ty.parse(lexical);
    }
    match value {
        Some(v) => {
            if !ty.check(v) {
                return Err(DbError::InvalidArg(format!(
                    "'{}' expects {}, got {}",
                    xpath,
                    ty.name(),
                    v.type_name()
                )));
            }
            Ok(v.clone())
        }
        None if *ty == LeafType::Empty => Ok(Value::LeafEmpty),
        None => Err(DbError::InvalidArg(format!(
            "'{}' requires a value of type {}",
            xpath,
            ty.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaBuilder;

    fn schema() -> ModuleSchema {
        let mut b = SchemaBuilder::new("m", "urn:m", "m");
        let container = b.container(None, "container");
        let list = b.list(Some(container), "list", &["key1", "key2"]);
        b.leaf(Some(list), "key1", LeafType::String);
        b.leaf(Some(list), "key2", LeafType::String);
        b.leaf(Some(list), "leaf", LeafType::String);
        b.leaf_list(Some(container), "options", LeafType::String);
        let ordered = b.user_list(None, "queue", &["name"]);
        b.leaf(Some(ordered), "name", LeafType::String);
        b.build()
    }

    fn set(tree: &mut DataTree, schema: &ModuleSchema, path: &str, value: Option<Value>) -> Result<()> {
        apply_set(
            tree,
            schema,
            &XPath::parse(path).unwrap(),
            value.as_ref(),
            EditFlags::default(),
        )
    }

    #[test]
    fn set_creates_ancestors_with_keys() {
        let schema = schema();
        let mut tree = DataTree::new("m");
        set(
            &mut tree,
            &schema,
            "/m:container/list[key1='a'][key2='b']/leaf",
            Some(Value::String("v".into())),
        )
        .unwrap();

        let found = XPath::parse("/m:container/list[key1='a'][key2='b']/leaf")
            .unwrap()
            .find(&tree, &schema)
            .unwrap();
        assert_eq!(found.len(), 1);
        // keys were materialized as leaves
        let keys = XPath::parse("/m:container/list[key1='a'][key2='b']/key1")
            .unwrap()
            .find(&tree, &schema)
            .unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn strict_set_reports_data_exists() {
        let schema = schema();
        let mut tree = DataTree::new("m");
        let path = "/m:container/list[key1='a'][key2='b']/leaf";
        set(&mut tree, &schema, path, Some(Value::String("v".into()))).unwrap();

        let err = apply_set(
            &mut tree,
            &schema,
            &XPath::parse(path).unwrap(),
            Some(&Value::String("w".into())),
            EditFlags::STRICT,
        )
        .unwrap_err();
        assert!(matches!(err, DbError::DataExists(_)));
    }

    #[test]
    fn non_recursive_set_requires_ancestors() {
        let schema = schema();
        let mut tree = DataTree::new("m");
        let err = apply_set(
            &mut tree,
            &schema,
            &XPath::parse("/m:container/list[key1='a'][key2='b']/leaf").unwrap(),
            Some(&Value::String("v".into())),
            EditFlags::NON_RECURSIVE,
        )
        .unwrap_err();
        assert!(matches!(err, DbError::DataMissing(_)));
    }

    #[test]
    fn leaf_list_predicate_takes_precedence() {
        let schema = schema();
        let mut tree = DataTree::new("m");
        set(
            &mut tree,
            &schema,
            "/m:container/options[.='from-predicate']",
            Some(Value::String("ignored".into())),
        )
        .unwrap();

        let found = XPath::parse("/m:container/options[.='from-predicate']")
            .unwrap()
            .find(&tree, &schema)
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn strict_delete_of_missing_node() {
        let schema = schema();
        let mut tree = DataTree::new("m");
        let err = apply_delete(
            &mut tree,
            &schema,
            &XPath::parse("/m:container/list[key1='x'][key2='y']").unwrap(),
            EditFlags::STRICT,
        )
        .unwrap_err();
        assert!(matches!(err, DbError::DataMissing(_)));

        // without strict it is a no-op
        apply_delete(
            &mut tree,
            &schema,
            &XPath::parse("/m:container/list[key1='x'][key2='y']").unwrap(),
            EditFlags::default(),
        )
        .unwrap();
    }

    #[test]
    fn keyless_delete_removes_all_instances() {
        let schema = schema();
        let mut tree = DataTree::new("m");
        set(&mut tree, &schema, "/m:container/list[key1='a'][key2='b']/leaf", Some(Value::String("1".into()))).unwrap();
        set(&mut tree, &schema, "/m:container/list[key1='c'][key2='d']/leaf", Some(Value::String("2".into()))).unwrap();

        apply_delete(
            &mut tree,
            &schema,
            &XPath::parse("/m:container/list").unwrap(),
            EditFlags::default(),
        )
        .unwrap();
        let remaining = XPath::parse("/m:container/list")
            .unwrap()
            .find(&tree, &schema)
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[test]
    fn non_recursive_delete_rejects_populated_list() {
        let schema = schema();
        let mut tree = DataTree::new("m");
        set(&mut tree, &schema, "/m:container/list[key1='a'][key2='b']/leaf", Some(Value::String("1".into()))).unwrap();

        let err = apply_delete(
            &mut tree,
            &schema,
            &XPath::parse("/m:container/list[key1='a'][key2='b']").unwrap(),
            EditFlags::NON_RECURSIVE,
        )
        .unwrap_err();
        assert!(matches!(err, DbError::OperationFailed(_)));
    }

    #[test]
    fn move_requires_user_ordering() {
        let schema = schema();
        let mut tree = DataTree::new("m");
        set(&mut tree, &schema, "/m:container/list[key1='a'][key2='b']/leaf", Some(Value::String("1".into()))).unwrap();

        let err = apply_move(
            &mut tree,
            &schema,
            &XPath::parse("/m:container/list[key1='a'][key2='b']").unwrap(),
            MovePosition::First,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, DbError::InvalidArg(_)));
    }

    #[test]
    fn move_reorders_user_list() {
        let schema = schema();
        let mut tree = DataTree::new("m");
        set(&mut tree, &schema, "/m:queue[name='a']", None).unwrap();
        set(&mut tree, &schema, "/m:queue[name='b']", None).unwrap();
        set(&mut tree, &schema, "/m:queue[name='c']", None).unwrap();

        apply_move(
            &mut tree,
            &schema,
            &XPath::parse("/m:queue[name='c']").unwrap(),
            MovePosition::Before,
            Some(&XPath::parse("/m:queue[name='a']").unwrap()),
        )
        .unwrap();

        let order: Vec<String> = tree
            .roots()
            .iter()
            .map(|&id| tree.list_key_values(id, &schema)[0].1.clone())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }
}

use crate::core::{DbError, ErrorInfo, Result, TypedValue};
use crate::schema::{LeafType, ModuleSchema, NodeKind, SchemaNodeId};
use crate::tree::node::{DataNodeId, DataTree};
use crate::tree::xpath::XPath;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Rpc,
    Action,
    EventNotification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Structural validation of a module tree against its schema.
///
/// Returns the collected errors; an empty list means the tree is valid.
pub fn validate_tree(schema: &ModuleSchema, tree: &DataTree) -> Vec<ErrorInfo> {
    let mut errors = Vec::new();
    validate_level(schema, tree, None, &mut errors);
    errors
}

fn validate_level(
    schema: &ModuleSchema,
    tree: &DataTree,
    parent: Option<DataNodeId>,
    errors: &mut Vec<ErrorInfo>,
) {
    let children = tree.children(parent).to_vec();

    // duplicate detection: non-list siblings by schema, list instances by
    // key tuple, leaf-lists by value
    let mut singleton_seen: HashSet<SchemaNodeId> = HashSet::new();
    let mut instance_seen: HashSet<(SchemaNodeId, String)> = HashSet::new();
    for &child in &children {
        let node = tree.node(child);
        match &schema.node(node.schema).kind {
            NodeKind::List { .. } => {
                let key = tree
                    .list_key_values(child, schema)
                    .into_iter()
                    .map(|(_, v)| v)
                    .collect::<Vec<_>>()
                    .join("\u{0}");
                if !instance_seen.insert((node.schema, key)) {
                    errors.push(ErrorInfo::new(
                        "duplicate list instance",
                        tree.path_of(child, schema),
                    ));
                }
            }
            NodeKind::LeafList { .. } => {
                let value = node
                    .value
                    .as_ref()
                    .and_then(|v| v.lexical())
                    .unwrap_or_default();
                if !instance_seen.insert((node.schema, value)) {
                    errors.push(ErrorInfo::new(
                        "duplicate leaf-list value",
                        tree.path_of(child, schema),
                    ));
                }
            }
            _ => {
                if !singleton_seen.insert(node.schema) {
                    errors.push(ErrorInfo::new(
                        format!("duplicate node '{}'", node.name),
                        tree.path_of(child, schema),
                    ));
                }
            }
        }
    }

    for &child in &children {
        let node = tree.node(child);
        match &schema.node(node.schema).kind {
            NodeKind::Leaf { ty, .. } | NodeKind::LeafList { ty, .. } => {
                let conforms = node.value.as_ref().map(|v| ty.check(v)).unwrap_or(false);
                if !conforms {
                    errors.push(ErrorInfo::new(
                        format!("value does not conform to type {}", ty.name()),
                        tree.path_of(child, schema),
                    ));
                }
            }
            NodeKind::List { keys, .. } => {
                for key in keys {
                    if tree.children_named(Some(child), key).is_empty() {
                        errors.push(ErrorInfo::new(
                            format!("missing key leaf '{}'", key),
                            tree.path_of(child, schema),
                        ));
                    }
                }
                validate_level(schema, tree, Some(child), errors);
            }
            NodeKind::Container { .. } => {
                check_mandatory(schema, tree, Some(child), node.schema, errors);
                validate_level(schema, tree, Some(child), errors);
            }
            _ => errors.push(ErrorInfo::new(
                "procedure node in data tree",
                tree.path_of(child, schema),
            )),
        }
    }

    if parent.is_none() {
        // top-level mandatory leaves
        let present: HashSet<SchemaNodeId> =
            children.iter().map(|&c| tree.node(c).schema).collect();
        for &root in schema.roots() {
            if let NodeKind::Leaf {
                mandatory: true, ..
            } = &schema.node(root).kind
            {
                if !present.contains(&root) {
                    errors.push(ErrorInfo::new(
                        format!("mandatory leaf '{}' missing", schema.node(root).name),
                        schema.path_of(root),
                    ));
                }
            }
        }
    }
}

fn check_mandatory(
    schema: &ModuleSchema,
    tree: &DataTree,
    parent: Option<DataNodeId>,
    parent_schema: SchemaNodeId,
    errors: &mut Vec<ErrorInfo>,
) {
    let present: HashSet<SchemaNodeId> = tree
        .children(parent)
        .iter()
        .map(|&c| tree.node(c).schema)
        .collect();
    for &child in &schema.node(parent_schema).children {
        if let NodeKind::Leaf {
            mandatory: true, ..
        } = &schema.node(child).kind
        {
            if !present.contains(&child) {
                errors.push(ErrorInfo::new(
                    format!("mandatory leaf '{}' missing", schema.node(child).name),
                    schema.path_of(child),
                ));
            }
        }
    }
}

/// Create default-origin nodes the schema implies: non-presence containers
/// and leaves with a default value. Never touches lists.
pub fn materialize_defaults(schema: &ModuleSchema, tree: &mut DataTree) {
    materialize_level(schema, tree, None, None);
}

fn materialize_level(
    schema: &ModuleSchema,
    tree: &mut DataTree,
    data_parent: Option<DataNodeId>,
    schema_parent: Option<SchemaNodeId>,
) {
    let schema_children: Vec<SchemaNodeId> = match schema_parent {
        Some(id) => schema.node(id).children.clone(),
        None => schema.roots().to_vec(),
    };

    for sid in schema_children {
        let existing: Vec<DataNodeId> = tree
            .children(data_parent)
            .iter()
            .copied()
            .filter(|&c| tree.node(c).schema == sid)
            .collect();
        match &schema.node(sid).kind {
            NodeKind::Container { presence: false } => {
                let container = match existing.first() {
                    Some(&id) => id,
                    None => {
                        let name = schema.node(sid).name.clone();
                        tree.add_node(data_parent, sid, name, None, true)
                    }
                };
                materialize_level(schema, tree, Some(container), Some(sid));
            }
            NodeKind::Container { presence: true } => {
                // presence containers only get defaults once they exist
                if let Some(&container) = existing.first() {
                    materialize_level(schema, tree, Some(container), Some(sid));
                }
            }
            NodeKind::Leaf {
                ty,
                default: Some(default),
                ..
            } => {
                if existing.is_empty() {
                    if let Ok(value) = ty.parse(default) {
                        let name = schema.node(sid).name.clone();
                        tree.add_node(data_parent, sid, name, Some(value), true);
                    }
                }
            }
            NodeKind::List { .. } => {
                for instance in existing {
                    materialize_level(schema, tree, Some(instance), Some(sid));
                }
            }
            _ => {}
        }
    }
}

/// Drop every node whose schema ancestry is not enabled for running.
pub fn prune_disabled(schema: &ModuleSchema, tree: &mut DataTree) {
    prune_level(schema, tree, None);
}

fn prune_level(schema: &ModuleSchema, tree: &mut DataTree, parent: Option<DataNodeId>) {
    let children = tree.children(parent).to_vec();
    for child in children {
        if !schema.effectively_enabled(tree.node(child).schema) {
            tree.remove_subtree(child);
        } else {
            prune_level(schema, tree, Some(child));
        }
    }
}

/// Commit-from-candidate guard: every top-level node must belong to an
/// enabled subtree.
pub fn check_enablement(schema: &ModuleSchema, tree: &DataTree) -> Result<()> {
    for &root in tree.roots() {
        if !schema.effectively_enabled(tree.node(root).schema) {
            return Err(DbError::OperationFailed(format!(
                "node '{}' is not enabled in the running datastore",
                tree.path_of(root, schema)
            )));
        }
    }
    Ok(())
}

/// Validate a procedure's arguments and complete them with input/output
/// defaults.
///
/// For procedures defined inside the data tree (actions, nested
/// notifications) the parent instance must exist in `data_view`.
pub fn validate_procedure(
    schema: &ModuleSchema,
    data_view: Option<&DataTree>,
    kind: ProcedureKind,
    xpath: &XPath,
    args: Vec<TypedValue>,
    direction: Direction,
) -> Result<Vec<TypedValue>> {
    let proc_node = xpath.resolve_schema(schema)?;
    let matches_kind = matches!(
        (&schema.node(proc_node).kind, kind),
        (NodeKind::Rpc, ProcedureKind::Rpc)
            | (NodeKind::Action, ProcedureKind::Action)
            | (NodeKind::Notification, ProcedureKind::EventNotification)
    );
    if !matches_kind {
        return Err(DbError::BadElement(format!(
            "'{}' is not a {:?}",
            xpath, kind
        )));
    }

    // data-tree-nested procedures require the parent instance to exist
    if xpath.steps.len() > 1 {
        let parent_path = XPath {
            steps: xpath.steps[..xpath.steps.len() - 1].to_vec(),
        };
        let parent_exists = data_view
            .map(|tree| {
                parent_path
                    .find(tree, schema)
                    .map(|found| !found.is_empty())
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if !parent_exists {
            return Err(DbError::BadElement(format!(
                "parent '{}' does not exist",
                parent_path
            )));
        }
    }

    let arg_container = match kind {
        ProcedureKind::EventNotification => proc_node,
        _ => {
            let wanted = match direction {
                Direction::Input => "input",
                Direction::Output => "output",
            };
            schema.find_child(Some(proc_node), wanted).ok_or_else(|| {
                DbError::BadElement(format!("'{}' has no {} block", xpath, wanted))
            })?
        }
    };

    let proc_path = xpath.to_string();
    let mut completed = Vec::with_capacity(args.len());
    let mut present: HashMap<SchemaNodeId, usize> = HashMap::new();

    for arg in args {
        // compare parsed steps, so quoting style in predicates is irrelevant
        let arg_path = XPath::parse(&arg.xpath)?;
        let within = arg_path.steps.len() > xpath.steps.len()
            && arg_path.steps[..xpath.steps.len()]
                .iter()
                .zip(&xpath.steps)
                .all(|(a, b)| a.name == b.name);
        if !within {
            return Err(DbError::BadElement(format!(
                "argument '{}' is outside procedure '{}'",
                arg.xpath, proc_path
            )));
        }
        let mut cursor = arg_container;
        for step in &arg_path.steps[xpath.steps.len()..] {
            cursor = schema.find_child(Some(cursor), &step.name).ok_or_else(|| {
                DbError::BadElement(format!("unknown argument node '{}'", arg.xpath))
            })?;
        }
        if let NodeKind::Leaf { ty, .. } | NodeKind::LeafList { ty, .. } =
            &schema.node(cursor).kind
        {
            if !ty.check(&arg.value) {
                return Err(DbError::InvalidArg(format!(
                    "argument '{}' expects {}, got {}",
                    arg.xpath,
                    ty.name(),
                    arg.value.type_name()
                )));
            }
        }
        *present.entry(cursor).or_insert(0) += 1;
        completed.push(arg);
    }

    // materialize defaults for absent direct children
    for &child in &schema.node(arg_container).children {
        if present.contains_key(&child) {
            continue;
        }
        if let NodeKind::Leaf {
            ty,
            default: Some(default),
            ..
        } = &schema.node(child).kind
        {
            if let Ok(value) = ty.parse(default) {
                completed.push(TypedValue::with_default(
                    format!("{}/{}", proc_path, schema.node(child).name),
                    value,
                ));
            }
        }
    }
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EditFlags, Value};
    use crate::schema::SchemaBuilder;
    use crate::tree::edit::apply_set;

    fn schema() -> ModuleSchema {
        let mut b = SchemaBuilder::new("test-module", "urn:test", "t");
        let main = b.container(None, "main");
        b.leaf(Some(main), "i8", LeafType::Int8);
        b.leaf_with_default(Some(main), "speed", LeafType::Uint32, "100");

        let (_, input, _output) = b.rpc("activate-software-image");
        b.leaf(Some(input), "image-name", LeafType::String);
        b.leaf_with_default(Some(input), "location", LeafType::String, "/");

        let modules = b.container(None, "kernel-modules");
        let module = b.list(Some(modules), "kernel-module", &["name"]);
        b.leaf(Some(module), "name", LeafType::String);
        let (_action, action_input, _) = b.action(module, "status-change");
        b.leaf(Some(action_input), "interval", LeafType::Uint16);
        b.build()
    }

    fn set(tree: &mut DataTree, schema: &ModuleSchema, path: &str, value: Option<Value>) {
        apply_set(
            tree,
            schema,
            &XPath::parse(path).unwrap(),
            value.as_ref(),
            EditFlags::default(),
        )
        .unwrap();
    }

    #[test]
    fn duplicate_leaf_is_reported_with_its_xpath() {
        let schema = schema();
        let mut tree = DataTree::new("test-module");
        set(&mut tree, &schema, "/test-module:main/i8", Some(Value::Int8(1)));
        // second instance of the same leaf, bypassing the edit API
        let main = tree.roots()[0];
        let i8_sid = schema.find_path(&["main", "i8"]).unwrap();
        tree.add_node(Some(main), i8_sid, "i8", Some(Value::Int8(2)), false);

        let errors = validate_tree(&schema, &tree);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].xpath, "/test-module:main/i8");
    }

    #[test]
    fn defaults_materialize_into_containers() {
        let schema = schema();
        let mut tree = DataTree::new("test-module");
        materialize_defaults(&schema, &mut tree);

        let speed = XPath::parse("/test-module:main/speed")
            .unwrap()
            .find(&tree, &schema)
            .unwrap();
        assert_eq!(speed.len(), 1);
        assert!(tree.node(speed[0]).default);
        assert_eq!(tree.node(speed[0]).value, Some(Value::Uint32(100)));
    }

    #[test]
    fn rpc_input_defaults_are_completed() {
        let schema = schema();
        let xpath = XPath::parse("/test-module:activate-software-image").unwrap();
        let args = vec![TypedValue::new(
            "/test-module:activate-software-image/image-name",
            Value::String("acmefw-2.3".into()),
        )];
        let completed =
            validate_procedure(&schema, None, ProcedureKind::Rpc, &xpath, args, Direction::Input)
                .unwrap();
        assert_eq!(completed.len(), 2);
        assert!(completed[1].origin_default);
        assert_eq!(
            completed[1].xpath,
            "/test-module:activate-software-image/location"
        );
    }

    #[test]
    fn unknown_rpc_argument_is_bad_element() {
        let schema = schema();
        let xpath = XPath::parse("/test-module:activate-software-image").unwrap();
        let args = vec![TypedValue::new(
            "/test-module:activate-software-image/non-existing-input",
            Value::String("x".into()),
        )];
        let err =
            validate_procedure(&schema, None, ProcedureKind::Rpc, &xpath, args, Direction::Input)
                .unwrap_err();
        assert!(matches!(err, DbError::BadElement(_)));
    }

    #[test]
    fn nested_action_requires_parent_instance() {
        let schema = schema();
        let mut tree = DataTree::new("test-module");
        set(
            &mut tree,
            &schema,
            "/test-module:kernel-modules/kernel-module[name='irqbypass.ko']",
            None,
        );

        let good = XPath::parse(
            "/test-module:kernel-modules/kernel-module[name=\"irqbypass.ko\"]/status-change",
        )
        .unwrap();
        assert!(
            validate_procedure(
                &schema,
                Some(&tree),
                ProcedureKind::Action,
                &good,
                Vec::new(),
                Direction::Input
            )
            .is_ok()
        );

        let missing = XPath::parse(
            "/test-module:kernel-modules/kernel-module[name=\"non-existent-module\"]/status-change",
        )
        .unwrap();
        let err = validate_procedure(
            &schema,
            Some(&tree),
            ProcedureKind::Action,
            &missing,
            Vec::new(),
            Direction::Input,
        )
        .unwrap_err();
        assert!(matches!(err, DbError::BadElement(_)));
    }

    #[test]
    fn prune_disabled_removes_subtrees() {
        let schema = schema();
        let mut tree = DataTree::new("test-module");
        set(&mut tree, &schema, "/test-module:main/i8", Some(Value::Int8(1)));
        set(
            &mut tree,
            &schema,
            "/test-module:kernel-modules/kernel-module[name='a']",
            None,
        );

        // only "main" is enabled
        let main = schema.find_path(&["main"]).unwrap();
        schema.enable_subtree(main);
        prune_disabled(&schema, &mut tree);

        assert_eq!(tree.roots().len(), 1);
        assert_eq!(tree.node(tree.roots()[0]).name, "main");
        assert!(check_enablement(&schema, &tree).is_ok());
    }

    #[test]
    fn enablement_check_fails_for_disabled_top_node() {
        let schema = schema();
        let mut tree = DataTree::new("test-module");
        set(&mut tree, &schema, "/test-module:main/i8", Some(Value::Int8(1)));
        let err = check_enablement(&schema, &tree).unwrap_err();
        assert!(matches!(err, DbError::OperationFailed(_)));
    }
}

use crate::core::ChangeOper;
use crate::schema::ModuleSchema;
use crate::subscription::registry::Subscription;
use crate::tree::diff::DiffEntry;

/// Does a diff entry fall within a subscription's interest?
///
/// With the subscription xpath denoting schema node S and the entry's node
/// having schema D:
/// 1. S equal to or an ancestor of D matches;
/// 2. else, when D is an ancestor of S and the entry created or deleted a
///    subtree, the subtree is searched for an instance of S;
/// 3. otherwise there is no match. An absent xpath covers the whole module.
pub fn subscription_matches(
    schema: &ModuleSchema,
    subscription: &Subscription,
    entry: &DiffEntry,
) -> bool {
    if subscription.module != schema.name {
        return false;
    }
    let Some(sub_xpath) = &subscription.xpath else {
        return true;
    };
    let Ok(sub_node) = sub_xpath.resolve_schema(schema) else {
        return false;
    };

    if schema.is_self_or_ancestor(sub_node, entry.schema) {
        return true;
    }
    if schema.is_self_or_ancestor(entry.schema, sub_node)
        && matches!(entry.oper, ChangeOper::Created | ChangeOper::Deleted)
    {
        return entry.subtree_schemas.contains(&sub_node);
    }
    false
}

/// True when any entry of the diff matches the subscription.
pub fn any_match(schema: &ModuleSchema, subscription: &Subscription, diff: &[DiffEntry]) -> bool {
    diff.iter()
        .any(|entry| subscription_matches(schema, subscription, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EditFlags, Value};
    use crate::schema::{LeafType, SchemaBuilder};
    use crate::subscription::registry::{NotifEventFilter, SubscriptionKind};
    use crate::tree::diff::diff_trees;
    use crate::tree::edit::{apply_delete, apply_set};
    use crate::tree::node::DataTree;
    use crate::tree::xpath::XPath;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn schema() -> ModuleSchema {
        let mut b = SchemaBuilder::new("m", "urn:m", "m");
        let c = b.container(None, "c");
        let list = b.list(Some(c), "item", &["name"]);
        b.leaf(Some(list), "name", LeafType::String);
        b.leaf(Some(list), "value", LeafType::Int32);
        b.container(None, "other");
        b.build()
    }

    fn subscription(xpath: Option<&str>) -> Subscription {
        let (tx, _rx) = mpsc::unbounded_channel();
        Subscription {
            id: 1,
            module: "m".to_string(),
            xpath: xpath.map(|x| XPath::parse(x).unwrap()),
            kind: SubscriptionKind::SubtreeChange,
            priority: 0,
            event_filter: NotifEventFilter::Both,
            enables_running: false,
            address: tx,
        }
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
    fn ancestor_subscription_matches_leaf_change() {
        let schema = schema();
        let mut old = DataTree::new("m");
        set(&mut old, &schema, "/m:c/item[name='a']/value", Some(Value::Int32(1)));
        let mut new = old.deep_copy();
        set(&mut new, &schema, "/m:c/item[name='a']/value", Some(Value::Int32(2)));

        let diff = diff_trees(&schema, &old, &new);
        assert!(any_match(&schema, &subscription(Some("/m:c")), &diff));
        assert!(any_match(&schema, &subscription(None), &diff));
        assert!(!any_match(&schema, &subscription(Some("/m:other")), &diff));
    }

    #[test]
    fn descendant_subscription_matches_created_subtree() {
        let schema = schema();
        let old = DataTree::new("m");
        let mut new = DataTree::new("m");
        set(&mut new, &schema, "/m:c/item[name='a']/value", Some(Value::Int32(1)));

        // diff entry is on /m:c (the created root); the subscription sits on
        // the deeper value leaf and matches through the subtree walk
        let diff = diff_trees(&schema, &old, &new);
        assert!(any_match(
            &schema,
            &subscription(Some("/m:c/item/value")),
            &diff
        ));
    }

    #[test]
    fn descendant_subscription_ignores_unrelated_modification() {
        let schema = schema();
        let mut old = DataTree::new("m");
        set(&mut old, &schema, "/m:c/item[name='a']/value", Some(Value::Int32(1)));
        let mut new = old.deep_copy();
        apply_delete(
            &mut new,
            &schema,
            &XPath::parse("/m:c/item[name='a']/value").unwrap(),
            EditFlags::default(),
        )
        .unwrap();

        // the deleted subtree is only the value leaf itself; a subscription
        // on a sibling container must not match
        let diff = diff_trees(&schema, &old, &new);
        let other = subscription(Some("/m:other"));
        assert!(!any_match(&schema, &other, &diff));
    }

    #[tokio::test]
    async fn arc_subscription_is_shareable() {
        let sub = Arc::new(subscription(None));
        let schema = schema();
        let diff: Vec<DiffEntry> = Vec::new();
        assert!(!any_match(&schema, &sub, &diff));
    }
}

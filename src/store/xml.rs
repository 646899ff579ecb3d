use crate::core::{DbError, Result};
use crate::schema::{ModuleSchema, NodeKind, SchemaNodeId};
use crate::tree::node::{DataNodeId, DataTree};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

/// Serialize a module tree to its on-disk XML form.
///
/// Top-level nodes are wrapped in a `<data>` envelope (XML wants a single
/// root) and carry the module namespace. `include_defaults` is false for the
/// persisted form; defaults are re-materialized on load.
pub fn serialize_tree(
    tree: &DataTree,
    schema: &ModuleSchema,
    include_defaults: bool,
) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Start(BytesStart::new("data")))
        .map_err(write_err)?;
    for &root in tree.roots() {
        write_node(&mut writer, tree, schema, root, true, include_defaults)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("data")))
        .map_err(write_err)?;
    Ok(writer.into_inner())
}

fn write_err<E: std::fmt::Display>(e: E) -> DbError {
    DbError::Internal(format!("xml write: {}", e))
}

fn write_node(
    writer: &mut Writer<Vec<u8>>,
    tree: &DataTree,
    schema: &ModuleSchema,
    id: DataNodeId,
    top_level: bool,
    include_defaults: bool,
) -> Result<()> {
    let node = tree.node(id);
    if node.default && !include_defaults {
        return Ok(());
    }
    // state data is assembled from providers, never persisted
    if !schema.node(node.schema).config {
        return Ok(());
    }

    let mut start = BytesStart::new(node.name.as_str());
    if top_level {
        start.push_attribute(("xmlns", schema.namespace.as_str()));
    }

    let text = node.value.as_ref().and_then(|v| v.lexical());
    if node.children.is_empty() && text.is_none() {
        writer
            .write_event(Event::Empty(start))
            .map_err(write_err)?;
        return Ok(());
    }

    writer.write_event(Event::Start(start)).map_err(write_err)?;
    if let Some(text) = text {
        writer
            .write_event(Event::Text(BytesText::new(&text)))
            .map_err(write_err)?;
    }
    for &child in &node.children {
        write_node(writer, tree, schema, child, false, include_defaults)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(node.name.as_str())))
        .map_err(write_err)?;
    Ok(())
}

struct Frame {
    data: Option<DataNodeId>,
    schema: Option<SchemaNodeId>,
    text: String,
}

/// Parse the on-disk XML form back into a tree. Elements the schema does not
/// know are a corruption of the data file.
pub fn parse_tree(bytes: &[u8], schema: &ModuleSchema, module: &str) -> Result<DataTree> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut tree = DataTree::new(module);
    let mut stack: Vec<Frame> = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| DbError::MalformedMsg(format!("xml parse: {}", e)))?;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                open_element(&mut tree, schema, &mut stack, name)?;
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                open_element(&mut tree, schema, &mut stack, name)?;
                close_element(&mut tree, schema, &mut stack)?;
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| DbError::MalformedMsg(format!("xml parse: {}", e)))?;
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    if let Some(frame) = stack.last_mut() {
                        frame.text.push_str(trimmed);
                    }
                }
            }
            Event::End(_) => close_element(&mut tree, schema, &mut stack)?,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(tree)
}

fn open_element(
    tree: &mut DataTree,
    schema: &ModuleSchema,
    stack: &mut Vec<Frame>,
    name: String,
) -> Result<()> {
    // envelope element
    if stack.is_empty() && name == "data" {
        stack.push(Frame {
            data: None,
            schema: None,
            text: String::new(),
        });
        return Ok(());
    }
    let (parent_data, parent_schema) = match stack.last() {
        Some(frame) => (frame.data, frame.schema),
        None => (None, None),
    };
    let sid = schema.find_child(parent_schema, &name).ok_or_else(|| {
        DbError::MalformedMsg(format!(
            "element '{}' unknown to module '{}'",
            name, schema.name
        ))
    })?;
    let did = tree.add_node(parent_data, sid, name, None, false);
    stack.push(Frame {
        data: Some(did),
        schema: Some(sid),
        text: String::new(),
    });
    Ok(())
}

fn close_element(tree: &mut DataTree, schema: &ModuleSchema, stack: &mut Vec<Frame>) -> Result<()> {
    let frame = stack
        .pop()
        .ok_or_else(|| DbError::MalformedMsg("unbalanced xml".to_string()))?;
    let (Some(did), Some(sid)) = (frame.data, frame.schema) else {
        return Ok(()); // envelope
    };
    match &schema.node(sid).kind {
        NodeKind::Leaf { ty, .. } | NodeKind::LeafList { ty, .. } => {
            let value = ty.parse(&frame.text)?;
            tree.node_mut(did).value = Some(value);
        }
        _ => {
            if !frame.text.is_empty() {
                return Err(DbError::MalformedMsg(format!(
                    "interior element '{}' carries text",
                    tree.node(did).name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EditFlags, Value};
    use crate::schema::{LeafType, SchemaBuilder};
    use crate::tree::edit::apply_set;
    use crate::tree::xpath::XPath;

    fn schema() -> ModuleSchema {
        let mut b = SchemaBuilder::new("m", "urn:test:m", "m");
        let c = b.container(None, "container");
        let list = b.list(Some(c), "list", &["name"]);
        b.leaf(Some(list), "name", LeafType::String);
        b.leaf(Some(list), "count", LeafType::Uint32);
        b.leaf(Some(c), "flag", LeafType::Empty);
        b.leaf_list(Some(c), "options", LeafType::String);
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
    fn round_trip_preserves_structure() {
        let schema = schema();
        let mut tree = DataTree::new("m");
        set(&mut tree, &schema, "/m:container/list[name='a']/count", Some(Value::Uint32(5)));
        set(&mut tree, &schema, "/m:container/flag", None);
        set(&mut tree, &schema, "/m:container/options[.='x < y']", None);

        let bytes = serialize_tree(&tree, &schema, false).unwrap();
        let parsed = parse_tree(&bytes, &schema, "m").unwrap();

        let count = XPath::parse("/m:container/list[name='a']/count")
            .unwrap()
            .find(&parsed, &schema)
            .unwrap();
        assert_eq!(count.len(), 1);
        assert_eq!(parsed.node(count[0]).value, Some(Value::Uint32(5)));

        let escaped = XPath::parse("/m:container/options[.='x < y']")
            .unwrap()
            .find(&parsed, &schema)
            .unwrap();
        assert_eq!(escaped.len(), 1);
    }

    #[test]
    fn defaults_are_stripped_from_disk_form() {
        let schema = schema();
        let mut tree = DataTree::new("m");
        set(&mut tree, &schema, "/m:container/list[name='a']/count", Some(Value::Uint32(5)));
        // mark the count leaf as default-originated
        let id = XPath::parse("/m:container/list[name='a']/count")
            .unwrap()
            .find(&tree, &schema)
            .unwrap()[0];
        tree.node_mut(id).default = true;

        let bytes = serialize_tree(&tree, &schema, false).unwrap();
        let parsed = parse_tree(&bytes, &schema, "m").unwrap();
        let found = XPath::parse("/m:container/list[name='a']/count")
            .unwrap()
            .find(&parsed, &schema)
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn unknown_element_is_rejected() {
        let schema = schema();
        let xml = b"<data><container xmlns=\"urn:test:m\"><bogus>1</bogus></container></data>";
        assert!(matches!(
            parse_tree(xml, &schema, "m"),
            Err(DbError::MalformedMsg(_))
        ));
    }
}

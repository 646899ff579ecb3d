use crate::core::{DbError, Result};
use crate::schema::{ModuleSchema, NodeKind, SchemaNodeId};
use crate::tree::node::{DataNodeId, DataTree};
use std::fmt;

/// One step of a location path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Module prefix if the step carried one (`module:name`).
    pub module: Option<String>,
    pub name: String,
    /// `[key='value']` predicates, in written order.
    pub keys: Vec<(String, String)>,
    /// `[.='value']` leaf-list predicate.
    pub value_predicate: Option<String>,
}

/// An absolute location path over one module's tree:
/// `/module:container/list[key1='a'][key2='b']/leaf`.
///
/// This is the addressing subset the engine needs; full XPath evaluation is
/// a collaborator concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XPath {
    pub steps: Vec<Step>,
}

impl XPath {
    pub fn parse(text: &str) -> Result<XPath> {
        let malformed =
            |detail: &str| DbError::InvalidArg(format!("xpath '{}': {}", text, detail));

        let rest = text
            .strip_prefix('/')
            .ok_or_else(|| malformed("must be absolute"))?;
        if rest.is_empty() {
            return Err(malformed("no steps"));
        }

        let mut steps = Vec::new();
        let mut chars = rest.chars().peekable();
        loop {
            // step name, optionally module-qualified
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c == '/' || c == '[' {
                    break;
                }
                token.push(c);
                chars.next();
            }
            if token.is_empty() {
                return Err(malformed("empty step"));
            }
            let (module, name) = match token.split_once(':') {
                Some((module, name)) => {
                    if module.is_empty() || name.is_empty() {
                        return Err(malformed("empty module prefix or name"));
                    }
                    (Some(module.to_string()), name.to_string())
                }
                None => (None, token),
            };

            // predicates
            let mut keys = Vec::new();
            let mut value_predicate = None;
            while chars.peek() == Some(&'[') {
                chars.next();
                let mut key = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '=' {
                        break;
                    }
                    key.push(c);
                    chars.next();
                }
                if chars.next() != Some('=') {
                    return Err(malformed("predicate without '='"));
                }
                let quote = match chars.next() {
                    Some(q @ ('\'' | '"')) => q,
                    _ => return Err(malformed("predicate value must be quoted")),
                };
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => value.push(c),
                        None => return Err(malformed("unterminated predicate value")),
                    }
                }
                if chars.next() != Some(']') {
                    return Err(malformed("predicate without ']'"));
                }
                let key = key.trim().to_string();
                if key == "." {
                    if value_predicate.replace(value).is_some() {
                        return Err(malformed("duplicate value predicate"));
                    }
                } else if key.is_empty() {
                    return Err(malformed("empty predicate key"));
                } else {
                    keys.push((key, value));
                }
            }

            steps.push(Step {
                module,
                name,
                keys,
                value_predicate,
            });

            match chars.next() {
                None => break,
                Some('/') => continue,
                Some(other) => {
                    return Err(malformed(&format!("unexpected character '{}'", other)));
                }
            }
        }

        if steps[0].module.is_none() {
            return Err(malformed("first step must carry a module prefix"));
        }
        Ok(XPath { steps })
    }

    /// Module the path addresses (prefix of the first step).
    pub fn module(&self) -> &str {
        self.steps[0].module.as_deref().unwrap_or("")
    }

    /// Resolve the path against the schema by names alone.
    pub fn resolve_schema(&self, schema: &ModuleSchema) -> Result<SchemaNodeId> {
        if self.module() != schema.name {
            return Err(DbError::UnknownModel(format!(
                "xpath addresses module '{}', schema is '{}'",
                self.module(),
                schema.name
            )));
        }
        let mut current: Option<SchemaNodeId> = None;
        for step in &self.steps {
            current = Some(schema.find_child(current, &step.name).ok_or_else(|| {
                DbError::BadElement(format!(
                    "no schema node '{}' under '{}'",
                    step.name,
                    current.map(|id| schema.path_of(id)).unwrap_or_default()
                ))
            })?);
        }
        current.ok_or_else(|| DbError::InvalidArg("empty xpath".to_string()))
    }

    /// Find all data nodes the path denotes. A list step without key
    /// predicates matches every instance.
    pub fn find(&self, tree: &DataTree, schema: &ModuleSchema) -> Result<Vec<DataNodeId>> {
        self.resolve_schema(schema)?;

        let mut frontier: Vec<Option<DataNodeId>> = vec![None];
        for step in &self.steps {
            let mut next = Vec::new();
            for parent in frontier {
                for candidate in tree.children_named(parent, &step.name) {
                    if step_matches(tree, schema, candidate, step) {
                        next.push(Some(candidate));
                    }
                }
            }
            if next.is_empty() {
                return Ok(Vec::new());
            }
            frontier = next;
        }
        Ok(frontier.into_iter().flatten().collect())
    }
}

pub(crate) fn step_matches(
    tree: &DataTree,
    schema: &ModuleSchema,
    id: DataNodeId,
    step: &Step,
) -> bool {
    let node = tree.node(id);
    match &schema.node(node.schema).kind {
        NodeKind::List { .. } => {
            let actual = tree.list_key_values(id, schema);
            step.keys.iter().all(|(key, wanted)| {
                actual
                    .iter()
                    .any(|(name, value)| name == key && value == wanted)
            })
        }
        NodeKind::LeafList { .. } => match &step.value_predicate {
            Some(wanted) => node
                .value
                .as_ref()
                .and_then(|v| v.lexical())
                .map(|lex| &lex == wanted)
                .unwrap_or(false),
            None => true,
        },
        _ => true,
    }
}

impl fmt::Display for XPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            f.write_str("/")?;
            if let Some(module) = &step.module {
                write!(f, "{}:", module)?;
            }
            f.write_str(&step.name)?;
            for (key, value) in &step.keys {
                write!(f, "[{}='{}']", key, value)?;
            }
            if let Some(value) = &step.value_predicate {
                write!(f, "[.='{}']", value)?;
            }
        }
        Ok(())
    }
}

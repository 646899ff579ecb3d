use crate::core::{DbError, EditFlags, MovePosition, Result, Value};
use crate::schema::ModuleSchema;
use crate::tree::edit::{apply_delete, apply_move, apply_set};
use crate::tree::node::DataTree;
use crate::tree::xpath::XPath;

/// One recorded edit primitive.
#[derive(Debug, Clone)]
pub enum EditOp {
    Set {
        xpath: String,
        value: Option<Value>,
        flags: EditFlags,
    },
    Delete {
        xpath: String,
        flags: EditFlags,
    },
    Move {
        xpath: String,
        position: MovePosition,
        relative: Option<String>,
    },
}

impl EditOp {
    pub fn xpath(&self) -> &str {
        match self {
            Self::Set { xpath, .. } | Self::Delete { xpath, .. } | Self::Move { xpath, .. } => {
                xpath
            }
        }
    }

    /// Module the edit addresses.
    pub fn module(&self) -> Result<String> {
        Ok(XPath::parse(self.xpath())?.module().to_string())
    }

    /// Apply against a tree with the same semantics as the original call.
    pub fn apply(&self, tree: &mut DataTree, schema: &ModuleSchema) -> Result<()> {
        match self {
            Self::Set {
                xpath,
                value,
                flags,
            } => apply_set(tree, schema, &XPath::parse(xpath)?, value.as_ref(), *flags),
            Self::Delete { xpath, flags } => {
                apply_delete(tree, schema, &XPath::parse(xpath)?, *flags)
            }
            Self::Move {
                xpath,
                position,
                relative,
            } => {
                let relative = match relative {
                    Some(r) => Some(XPath::parse(r)?),
                    None => None,
                };
                apply_move(
                    tree,
                    schema,
                    &XPath::parse(xpath)?,
                    *position,
                    relative.as_ref(),
                )
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggedOp {
    pub op: EditOp,
    /// Sticky: set once the entry failed during a replay.
    pub has_error: bool,
}

/// Append-only edit log, per (session, datastore).
#[derive(Debug, Default)]
pub struct OpLog {
    entries: Vec<LoggedOp>,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, op: EditOp) {
        self.entries.push(LoggedOp {
            op,
            has_error: false,
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[LoggedOp] {
        &self.entries
    }

    /// Modules touched by the logged edits.
    pub fn modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = Vec::new();
        for entry in &self.entries {
            if let Ok(module) = entry.op.module() {
                if !modules.contains(&module) {
                    modules.push(module);
                }
            }
        }
        modules
    }

    /// Replay this log for one module over a refreshed base.
    ///
    /// Each pass runs over a fresh copy of the base; an entry that errors is
    /// marked, dropped, and the pass restarts. The log only shrinks, so the
    /// loop terminates. Returns the rebased tree and the number of entries
    /// dropped.
    pub fn replay(
        &mut self,
        module: &str,
        base: &DataTree,
        schema: &ModuleSchema,
    ) -> (DataTree, usize) {
        let mut dropped = 0;
        loop {
            let mut working = base.deep_copy();
            let mut failed: Option<usize> = None;
            for (index, entry) in self.entries.iter().enumerate() {
                match entry.op.module() {
                    Ok(m) if m == module => {}
                    _ => continue,
                }
                if entry.op.apply(&mut working, schema).is_err() {
                    failed = Some(index);
                    break;
                }
            }
            match failed {
                Some(index) => {
                    self.entries[index].has_error = true;
                    self.entries.remove(index);
                    dropped += 1;
                }
                None => return (working, dropped),
            }
        }
    }
}

use crate::core::{DbError, Result, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::RwLock;

pub type SchemaNodeId = usize;

/// Leaf value type as modeled by the schema.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafType {
    Empty,
    Union,
    Binary,
    Bits,
    Bool,
    Decimal64,
    Enumeration(Vec<String>),
    IdentityRef,
    InstanceId,
    Int8,
    Int16,
    Int32,
    Int64,
    String,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
}

impl LeafType {
    /// Parse the lexical (XML / predicate) form into a typed value.
    pub fn parse(&self, lexical: &str) -> Result<Value> {
        let type_err = |detail: &str| {
            DbError::InvalidArg(format!("'{}' is not a valid {}", detail, self.name()))
        };
        match self {
            Self::Empty => Ok(Value::LeafEmpty),
            Self::Union => Ok(Value::Union(lexical.to_string())),
            Self::Binary => Ok(Value::Binary(lexical.to_string())),
            Self::Bits => Ok(Value::Bits(lexical.to_string())),
            Self::Bool => match lexical {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(type_err(other)),
            },
            Self::Decimal64 => lexical
                .parse::<f64>()
                .map(Value::Decimal64)
                .map_err(|_| type_err(lexical)),
            Self::Enumeration(variants) => {
                if variants.iter().any(|v| v == lexical) {
                    Ok(Value::Enum(lexical.to_string()))
                } else {
                    Err(type_err(lexical))
                }
            }
            Self::IdentityRef => Ok(Value::IdentityRef(lexical.to_string())),
            Self::InstanceId => Ok(Value::InstanceId(lexical.to_string())),
            Self::Int8 => lexical.parse().map(Value::Int8).map_err(|_| type_err(lexical)),
            Self::Int16 => lexical.parse().map(Value::Int16).map_err(|_| type_err(lexical)),
            Self::Int32 => lexical.parse().map(Value::Int32).map_err(|_| type_err(lexical)),
            Self::Int64 => lexical.parse().map(Value::Int64).map_err(|_| type_err(lexical)),
            Self::String => Ok(Value::String(lexical.to_string())),
            Self::Uint8 => lexical.parse().map(Value::Uint8).map_err(|_| type_err(lexical)),
            Self::Uint16 => lexical.parse().map(Value::Uint16).map_err(|_| type_err(lexical)),
            Self::Uint32 => lexical.parse().map(Value::Uint32).map_err(|_| type_err(lexical)),
            Self::Uint64 => lexical.parse().map(Value::Uint64).map_err(|_| type_err(lexical)),
        }
    }

    /// Does an already-typed value conform to this leaf type?
    pub fn check(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Empty, Value::LeafEmpty) => true,
            (Self::Union, Value::Union(_)) => true,
            (Self::Binary, Value::Binary(_)) => true,
            (Self::Bits, Value::Bits(_)) => true,
            (Self::Bool, Value::Bool(_)) => true,
            (Self::Decimal64, Value::Decimal64(_)) => true,
            (Self::Enumeration(variants), Value::Enum(v)) => variants.iter().any(|e| e == v),
            (Self::IdentityRef, Value::IdentityRef(_)) => true,
            (Self::InstanceId, Value::InstanceId(_)) => true,
            (Self::Int8, Value::Int8(_)) => true,
            (Self::Int16, Value::Int16(_)) => true,
            (Self::Int32, Value::Int32(_)) => true,
            (Self::Int64, Value::Int64(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Uint8, Value::Uint8(_)) => true,
            (Self::Uint16, Value::Uint16(_)) => true,
            (Self::Uint32, Value::Uint32(_)) => true,
            (Self::Uint64, Value::Uint64(_)) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Union => "union",
            Self::Binary => "binary",
            Self::Bits => "bits",
            Self::Bool => "boolean",
            Self::Decimal64 => "decimal64",
            Self::Enumeration(_) => "enumeration",
            Self::IdentityRef => "identityref",
            Self::InstanceId => "instance-identifier",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::String => "string",
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Container {
        presence: bool,
    },
    List {
        keys: Vec<String>,
        user_ordered: bool,
    },
    Leaf {
        ty: LeafType,
        default: Option<String>,
        mandatory: bool,
    },
    LeafList {
        ty: LeafType,
        user_ordered: bool,
    },
    Rpc,
    Action,
    Notification,
    Input,
    Output,
}

impl NodeKind {
    pub fn is_procedure(&self) -> bool {
        matches!(self, Self::Rpc | Self::Action | Self::Notification)
    }
}

/// Per-node running-datastore enablement.
///
/// `Enabled` marks a node on the path to an enabled subtree; the subtree root
/// itself is `EnabledWithChildren` so descendants inherit without their own
/// marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enablement {
    Disabled,
    Enabled,
    EnabledWithChildren,
}

#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub name: String,
    pub kind: NodeKind,
    /// `config true` data vs `config false` (state) data.
    pub config: bool,
    pub parent: Option<SchemaNodeId>,
    pub children: Vec<SchemaNodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submodule {
    pub name: String,
    pub revision: Option<String>,
}

/// Immutable tree of schema nodes plus the two mutable cells shared by every
/// session: the feature set and the per-node enablement.
///
/// Nodes live in an arena addressed by `SchemaNodeId`; parents and children
/// reference each other by index so subtree walks never fight the borrow
/// checker over ownership.
#[derive(Debug)]
pub struct ModuleSchema {
    pub name: String,
    pub revision: Option<String>,
    pub namespace: String,
    pub prefix: String,
    pub filepath: Option<PathBuf>,
    pub submodules: Vec<Submodule>,
    pub(crate) nodes: Vec<SchemaNode>,
    pub(crate) roots: Vec<SchemaNodeId>,
    features: RwLock<HashSet<String>>,
    enablement: RwLock<Vec<Enablement>>,
}

impl ModuleSchema {
    pub(crate) fn from_parts(
        name: String,
        revision: Option<String>,
        namespace: String,
        prefix: String,
        filepath: Option<PathBuf>,
        submodules: Vec<Submodule>,
        nodes: Vec<SchemaNode>,
        roots: Vec<SchemaNodeId>,
    ) -> Self {
        let enablement = vec![Enablement::Disabled; nodes.len()];
        Self {
            name,
            revision,
            namespace,
            prefix,
            filepath,
            submodules,
            nodes,
            roots,
            features: RwLock::new(HashSet::new()),
            enablement: RwLock::new(enablement),
        }
    }

    pub fn node(&self, id: SchemaNodeId) -> &SchemaNode {
        &self.nodes[id]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn roots(&self) -> &[SchemaNodeId] {
        &self.roots
    }

    /// Child of `parent` (or top-level node when `parent` is None) by name.
    pub fn find_child(&self, parent: Option<SchemaNodeId>, name: &str) -> Option<SchemaNodeId> {
        let candidates = match parent {
            Some(id) => &self.nodes[id].children,
            None => &self.roots,
        };
        candidates
            .iter()
            .copied()
            .find(|&id| self.nodes[id].name == name)
    }

    /// Resolve a chain of child names from the top level.
    pub fn find_path(&self, names: &[&str]) -> Option<SchemaNodeId> {
        let mut current = None;
        for name in names {
            current = Some(self.find_child(current, name)?);
        }
        current
    }

    /// Schema path of a node: `/module:a/b/c`.
    pub fn path_of(&self, id: SchemaNodeId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            names.push(self.nodes[node_id].name.clone());
            cursor = self.nodes[node_id].parent;
        }
        names.reverse();
        format!("/{}:{}", self.name, names.join("/"))
    }

    /// Is `ancestor` equal to or an ancestor of `node`?
    pub fn is_self_or_ancestor(&self, ancestor: SchemaNodeId, node: SchemaNodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.nodes[id].parent;
        }
        false
    }

    // ------------------------------------------------------------------
    // Features
    // ------------------------------------------------------------------

    pub fn feature_enabled(&self, feature: &str) -> bool {
        self.features
            .read()
            .map(|set| set.contains(feature))
            .unwrap_or(false)
    }

    pub fn enabled_features(&self) -> Vec<String> {
        self.features
            .read()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn set_feature(&self, feature: &str, enabled: bool) -> bool {
        let mut set = match self.features.write() {
            Ok(set) => set,
            Err(_) => return false,
        };
        if enabled {
            set.insert(feature.to_string())
        } else {
            set.remove(feature)
        }
    }

    // ------------------------------------------------------------------
    // Enablement
    // ------------------------------------------------------------------

    pub fn enablement(&self, id: SchemaNodeId) -> Enablement {
        self.enablement
            .read()
            .map(|cells| cells[id])
            .unwrap_or(Enablement::Disabled)
    }

    pub fn set_enablement(&self, id: SchemaNodeId, state: Enablement) {
        if let Ok(mut cells) = self.enablement.write() {
            cells[id] = state;
        }
    }

    /// Mark the subtree rooted at `id` enabled: the root inherits to its
    /// children, ancestors become path nodes.
    pub fn enable_subtree(&self, id: SchemaNodeId) {
        if let Ok(mut cells) = self.enablement.write() {
            cells[id] = Enablement::EnabledWithChildren;
            let mut cursor = self.nodes[id].parent;
            while let Some(parent_id) = cursor {
                if cells[parent_id] == Enablement::Disabled {
                    cells[parent_id] = Enablement::Enabled;
                }
                cursor = self.nodes[parent_id].parent;
            }
        }
    }

    /// A node may appear in the running datastore iff no step of its schema
    /// ancestry is effectively disabled.
    pub fn effectively_enabled(&self, id: SchemaNodeId) -> bool {
        let cells = match self.enablement.read() {
            Ok(cells) => cells,
            Err(_) => return false,
        };
        if cells[id] != Enablement::Disabled {
            return true;
        }
        let mut cursor = self.nodes[id].parent;
        while let Some(parent_id) = cursor {
            if cells[parent_id] == Enablement::EnabledWithChildren {
                return true;
            }
            cursor = self.nodes[parent_id].parent;
        }
        false
    }

    /// Running is populated for this module only when something is enabled.
    pub fn has_enabled_subtree(&self) -> bool {
        self.enablement
            .read()
            .map(|cells| cells.iter().any(|&c| c != Enablement::Disabled))
            .unwrap_or(false)
    }

    /// Roots of `config false` subtrees, the targets of operational-data
    /// provider queries.
    pub fn op_data_roots(&self) -> Vec<SchemaNodeId> {
        let mut roots = Vec::new();
        for (id, node) in self.nodes.iter().enumerate() {
            if node.config {
                continue;
            }
            let parent_config = node.parent.map(|p| self.nodes[p].config).unwrap_or(true);
            if parent_config {
                roots.push(id);
            }
        }
        roots
    }

    pub fn has_operational_data(&self) -> bool {
        self.nodes.iter().any(|node| !node.config)
    }
}

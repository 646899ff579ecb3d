pub mod builder;
pub mod dependency;
pub mod model;
pub mod registry;

pub use builder::SchemaBuilder;
pub use dependency::{DepEdge, DepEntry, DepKind, ModuleDepIndex};
pub use model::{Enablement, LeafType, ModuleSchema, NodeKind, SchemaNode, SchemaNodeId};
pub use registry::{SchemaLoader, SchemaRegistry};

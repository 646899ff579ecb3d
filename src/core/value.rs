use crate::core::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed payload of a single data-tree element.
///
/// The container/list variants carry no payload; they exist so a value list
/// can describe a whole subtree (providers return these for nested state
/// data, and `get_items` yields them for non-leaf matches).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    List,
    Container,
    PresenceContainer,
    LeafEmpty,
    Union(String),
    Binary(String),
    Bits(String),
    Bool(bool),
    Decimal64(f64),
    Enum(String),
    IdentityRef(String),
    InstanceId(String),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    String(String),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Container => "container",
            Self::PresenceContainer => "presence-container",
            Self::LeafEmpty => "empty",
            Self::Union(_) => "union",
            Self::Binary(_) => "binary",
            Self::Bits(_) => "bits",
            Self::Bool(_) => "boolean",
            Self::Decimal64(_) => "decimal64",
            Self::Enum(_) => "enumeration",
            Self::IdentityRef(_) => "identityref",
            Self::InstanceId(_) => "instance-identifier",
            Self::Int8(_) => "int8",
            Self::Int16(_) => "int16",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::String(_) => "string",
            Self::Uint8(_) => "uint8",
            Self::Uint16(_) => "uint16",
            Self::Uint32(_) => "uint32",
            Self::Uint64(_) => "uint64",
        }
    }

    /// True for variants that denote interior nodes rather than leaf payloads.
    pub fn is_interior(&self) -> bool {
        matches!(self, Self::List | Self::Container | Self::PresenceContainer)
    }

    /// Lexical representation used by the on-disk XML form and by key
    /// predicates. Interior nodes and `empty` leaves have none.
    pub fn lexical(&self) -> Option<String> {
        match self {
            Self::List | Self::Container | Self::PresenceContainer | Self::LeafEmpty => None,
            Self::Union(s)
            | Self::Binary(s)
            | Self::Bits(s)
            | Self::Enum(s)
            | Self::IdentityRef(s)
            | Self::InstanceId(s)
            | Self::String(s) => Some(s.clone()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Decimal64(d) => Some(d.to_string()),
            Self::Int8(v) => Some(v.to_string()),
            Self::Int16(v) => Some(v.to_string()),
            Self::Int32(v) => Some(v.to_string()),
            Self::Int64(v) => Some(v.to_string()),
            Self::Uint8(v) => Some(v.to_string()),
            Self::Uint16(v) => Some(v.to_string()),
            Self::Uint32(v) => Some(v.to_string()),
            Self::Uint64(v) => Some(v.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Union(s)
            | Self::Binary(s)
            | Self::Bits(s)
            | Self::Enum(s)
            | Self::IdentityRef(s)
            | Self::InstanceId(s)
            | Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v) => Some(i64::from(*v)),
            Self::Int16(v) => Some(i64::from(*v)),
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            Self::Uint8(v) => Some(i64::from(*v)),
            Self::Uint16(v) => Some(i64::from(*v)),
            Self::Uint32(v) => Some(i64::from(*v)),
            Self::Uint64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lexical() {
            Some(s) => f.write_str(&s),
            None => write!(f, "({})", self.type_name()),
        }
    }
}

/// A value together with its location and default provenance, the unit of
/// exchange with clients and operational-data providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    pub xpath: String,
    /// The value was materialized from a schema default, not set by a client.
    pub origin_default: bool,
    pub value: Value,
}

impl TypedValue {
    pub fn new(xpath: impl Into<String>, value: Value) -> Self {
        Self {
            xpath: xpath.into(),
            origin_default: false,
            value,
        }
    }

    pub fn with_default(xpath: impl Into<String>, value: Value) -> Self {
        Self {
            xpath: xpath.into(),
            origin_default: true,
            value,
        }
    }

    /// Module name owning this value, taken from the first path step.
    pub fn module(&self) -> Result<&str> {
        let trimmed = self.xpath.strip_prefix('/').unwrap_or(&self.xpath);
        let first = trimmed.split('/').next().unwrap_or("");
        match first.split_once(':') {
            Some((module, _)) if !module.is_empty() => Ok(module),
            _ => Err(DbError::InvalidArg(format!(
                "xpath '{}' carries no module prefix",
                self.xpath
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_forms() {
        assert_eq!(Value::Bool(true).lexical().as_deref(), Some("true"));
        assert_eq!(Value::Int8(-3).lexical().as_deref(), Some("-3"));
        assert_eq!(Value::String("v".into()).lexical().as_deref(), Some("v"));
        assert_eq!(Value::Container.lexical(), None);
        assert_eq!(Value::LeafEmpty.lexical(), None);
    }

    #[test]
    fn typed_value_module() {
        let v = TypedValue::new("/example-module:container/leaf", Value::LeafEmpty);
        assert_eq!(v.module().unwrap(), "example-module");
        let bad = TypedValue::new("container/leaf", Value::LeafEmpty);
        assert!(bad.module().is_err());
    }
}

//! # Typed Property Values
//!
//! Leaf values carried in notifies and updates. Structs and containers are
//! never values themselves; they are expressed as sets of leaf paths.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire type of a leaf property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    /// Boolean.
    Bool,
    /// Signed integer (up to 64 bits).
    Int,
    /// Unsigned integer (up to 64 bits).
    UInt,
    /// IEEE-754 double.
    Float,
    /// UTF-8 string.
    Text,
    /// Opaque byte string.
    Bytes,
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::UInt => "uint",
            TypeTag::Float => "float",
            TypeTag::Text => "text",
            TypeTag::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// A leaf property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Explicit null (only valid for nullable properties).
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Unsigned integer value.
    UInt(u64),
    /// Floating point value.
    Float(f64),
    /// String value.
    Text(String),
    /// Byte string value.
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// Type tag of this value; `None` for `Null`.
    pub fn type_tag(&self) -> Option<TypeTag> {
        match self {
            PropertyValue::Null => None,
            PropertyValue::Bool(_) => Some(TypeTag::Bool),
            PropertyValue::Int(_) => Some(TypeTag::Int),
            PropertyValue::UInt(_) => Some(TypeTag::UInt),
            PropertyValue::Float(_) => Some(TypeTag::Float),
            PropertyValue::Text(_) => Some(TypeTag::Text),
            PropertyValue::Bytes(_) => Some(TypeTag::Bytes),
        }
    }

    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::UInt(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

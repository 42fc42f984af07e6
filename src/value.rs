use std::fmt;

use crate::data::model::NumericArray;

// ---------------------------------------------------------------------------
// ClassPath – `module.name` of a Python global
// ---------------------------------------------------------------------------

/// Fully qualified name of a class or function referenced by an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassPath {
    pub module: String,
    pub name: String,
}

impl ClassPath {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClassPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

// ---------------------------------------------------------------------------
// Object – an instance of a class the decoder has no special handling for
// ---------------------------------------------------------------------------

/// A generic object: its class, constructor arguments and `__setstate__` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub class: ClassPath,
    pub args: Vec<Value>,
    pub state: Option<Box<Value>>,
}

impl Object {
    /// Look up an instance attribute in a dictionary state.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.state.as_deref().and_then(|state| state.get(name))
    }
}

// ---------------------------------------------------------------------------
// Value – the neutral tree every artifact format decodes into
// ---------------------------------------------------------------------------

/// A deserialized artifact, independent of the format it came from.
///
/// Mappings keep their entries in source order as key/value pairs because
/// keys are not restricted to strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Global(ClassPath),
    Object(Object),
    Array(NumericArray),
}

impl Value {
    /// Short description of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Global(_) => "global",
            Value::Object(_) => "object",
            Value::Array(_) => "ndarray",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a string key in a mapping.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Integer view, accepting 0-d integer arrays (NumPy scalars).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Array(array) => array.as_scalar_i64(),
            _ => None,
        }
    }
}

use std::fmt;

/// A value crossing the host/script boundary, in either direction. Members
/// buffers hold these too, so call dispatch never converts representations.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    String(String),
    Id(u64),
}

impl Value {
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Number(_) => ValueTag::Number,
            Value::Bool(_) => ValueTag::Bool,
            Value::String(_) => ValueTag::String,
            Value::Id(_) => ValueTag::Id,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<u64> {
        match self {
            Value::Id(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Id(id) => write!(f, "id({id})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    Number,
    Bool,
    String,
    Id,
}

impl fmt::Display for ValueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValueTag::Number => "number",
            ValueTag::Bool => "bool",
            ValueTag::String => "string",
            ValueTag::Id => "id",
        };
        f.write_str(label)
    }
}

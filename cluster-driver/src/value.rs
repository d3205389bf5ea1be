//! Typed values carried by keys and bins.

use std::fmt;

use serde::Serialize;

/// Particle type tags used on the wire.
pub mod particle {
    pub const NIL: u8 = 0;
    pub const INTEGER: u8 = 1;
    pub const FLOAT: u8 = 2;
    pub const STRING: u8 = 3;
    pub const BLOB: u8 = 4;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Nil,
    Int(i64),
    Float(f64),
    Str(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn particle_type(&self) -> u8 {
        match self {
            Value::Nil => particle::NIL,
            Value::Int(_) => particle::INTEGER,
            Value::Float(_) => particle::FLOAT,
            Value::Str(_) => particle::STRING,
            Value::Blob(_) => particle::BLOB,
        }
    }

    /// Encoded payload bytes, without the type tag.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Nil => Vec::new(),
            Value::Int(v) => v.to_be_bytes().to_vec(),
            Value::Float(v) => v.to_bits().to_be_bytes().to_vec(),
            Value::Str(s) => s.as_bytes().to_vec(),
            Value::Blob(b) => b.clone(),
        }
    }

    /// Decodes a payload previously produced by [`Value::to_bytes`].
    ///
    /// Returns `None` for unknown particle types or malformed numeric payloads.
    pub fn from_bytes(particle_type: u8, bytes: &[u8]) -> Option<Value> {
        match particle_type {
            particle::NIL => Some(Value::Nil),
            particle::INTEGER => {
                let raw: [u8; 8] = bytes.try_into().ok()?;
                Some(Value::Int(i64::from_be_bytes(raw)))
            }
            particle::FLOAT => {
                let raw: [u8; 8] = bytes.try_into().ok()?;
                Some(Value::Float(f64::from_bits(u64::from_be_bytes(raw))))
            }
            particle::STRING => String::from_utf8(bytes.to_vec()).ok().map(Value::Str),
            particle::BLOB => Some(Value::Blob(bytes.to_vec())),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

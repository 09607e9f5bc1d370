use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One typed cell as produced or consumed by the engine.
///
/// Text and blobs are length-prefixed on the wire: embedded zero bytes
/// round-trip exactly and are never treated as terminators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    /// Reserves an all-zero cell of the given length, filled in later through
    /// the blob channel.
    ZeroBlob(i32),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_integer(&self) -> Result<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            other => Err(Error::Type(format!("expected integer, got {}", other.type_name()))),
        }
    }

    pub fn as_real(&self) -> Result<f64> {
        match self {
            Self::Real(f) => Ok(*f),
            Self::Integer(i) => Ok(*i as f64),
            other => Err(Error::Type(format!("expected real, got {}", other.type_name()))),
        }
    }

    pub fn as_text(&self) -> Result<&str> {
        match self {
            Self::Text(s) => Ok(s),
            other => Err(Error::Type(format!("expected text, got {}", other.type_name()))),
        }
    }

    pub fn as_blob(&self) -> Result<&[u8]> {
        match self {
            Self::Blob(b) => Ok(b),
            other => Err(Error::Type(format!("expected blob, got {}", other.type_name()))),
        }
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
            Self::ZeroBlob(_) => "zeroblob",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Blob(b) => write!(f, "\\x{}", hex::encode(b)),
            Self::ZeroBlob(n) => write!(f, "zeroblob({n})"),
        }
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Real(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Blob(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Self>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl TryFrom<u64> for Value {
    type Error = Error;

    fn try_from(v: u64) -> Result<Self> {
        i64::try_from(v)
            .map(Self::Integer)
            .map_err(|_| Error::overflow(format!("{v} does not fit a 64-bit signed integer")))
    }
}

impl TryFrom<i128> for Value {
    type Error = Error;

    fn try_from(v: i128) -> Result<Self> {
        i64::try_from(v)
            .map(Self::Integer)
            .map_err(|_| Error::overflow(format!("{v} does not fit a 64-bit signed integer")))
    }
}

impl TryFrom<u128> for Value {
    type Error = Error;

    fn try_from(v: u128) -> Result<Self> {
        i64::try_from(v)
            .map(Self::Integer)
            .map_err(|_| Error::overflow(format!("{v} does not fit a 64-bit signed integer")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_widths_convert_exactly() {
        assert_eq!(Value::from(-1i8), Value::Integer(-1));
        assert_eq!(Value::from(u32::MAX), Value::Integer(4_294_967_295));
        assert_eq!(Value::from(i64::MIN), Value::Integer(i64::MIN));
        assert_eq!(Value::from(true), Value::Integer(1));
    }

    #[test]
    fn out_of_range_integers_overflow() {
        assert!(matches!(Value::try_from(u64::MAX), Err(Error::Overflow(_))));
        assert!(matches!(
            Value::try_from(i128::from(i64::MAX) + 1),
            Err(Error::Overflow(_))
        ));
        assert_eq!(
            Value::try_from(u64::from(u32::MAX)).unwrap(),
            Value::Integer(4_294_967_295)
        );
    }

    #[test]
    fn option_maps_to_null() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(7i64)), Value::Integer(7));
    }

    #[test]
    fn extraction_is_typed() {
        let v = Value::Text("abc".into());
        assert_eq!(v.as_text().unwrap(), "abc");
        assert!(matches!(v.as_integer(), Err(Error::Type(_))));
        assert_eq!(Value::Integer(3).as_real().unwrap(), 3.0);
    }

    #[test]
    fn blobs_keep_embedded_zero_bytes() {
        let raw = vec![1u8, 0, 2, 0, 0, 3];
        let v = Value::from(raw.clone());
        assert_eq!(v.as_blob().unwrap(), raw.as_slice());
    }
}

use std::collections::HashMap;

use crate::error::Result;
use crate::value::Value;

/// Bindings supplied to one execution.
///
/// Positional values are consumed left to right across every statement of a
/// multi-statement text. Named bindings are looked up per parameter; a name
/// missing from the map binds NULL.
#[derive(Debug, Clone, Default)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<Value>),
    Named(HashMap<String, Value>),
}

impl Params {
    pub fn positional<I>(values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Self::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<()> for Params {
    fn from((): ()) -> Self {
        Self::None
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Self::Positional(values)
    }
}

impl<const N: usize> From<[Value; N]> for Params {
    fn from(values: [Value; N]) -> Self {
        Self::Positional(values.into())
    }
}

impl From<HashMap<String, Value>> for Params {
    fn from(map: HashMap<String, Value>) -> Self {
        Self::Named(map)
    }
}

/// Called once per statement before it runs, with the statement text and the
/// bindings in effect; returning `Ok(false)` aborts that statement.
pub type ExecTraceHandler = Box<dyn FnMut(&str, &Params) -> Result<bool> + Send>;

/// Called once per produced row; may replace the row, or return `Ok(None)` to
/// suppress it from the visible result.
pub type RowTraceHandler = Box<dyn FnMut(Vec<Value>) -> Result<Option<Vec<Value>>> + Send>;

//! The host value model and its literal-source serializer.
//!
//! Context variables and constants live on the host side as [`Value`]s.
//! Before a script block runs, each one is rendered back into a source
//! fragment that reconstructs the same value when the block is evaluated,
//! so re-serializing is the only bridge the prelude needs.

use std::fmt;

/// A host-side script value.
///
/// Mappings and arrays preserve insertion order; order is observable both in
/// serialized output and in iteration inside script blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision integer, canonical decimal digits.
    BigInt(String),
    Str(String),
    Array(Vec<Value>),
    /// Ordered name → value pairs.
    Object(Vec<(String, Value)>),
    /// A function's source text as retrievable from the evaluator.
    Function(String),
    /// Milliseconds since the epoch.
    Date(i64),
    Regex {
        source: String,
        flags: String,
    },
    /// A symbol's textual description.
    Symbol(Option<String>),
}

impl Value {
    /// Renders the value as a source fragment that evaluates back to an
    /// equal value.
    pub fn to_source(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Undefined => "undefined".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => render_float(*f),
            Value::BigInt(digits) => format!("{digits}n"),
            Value::Str(s) => render_template_literal(s),
            Value::Array(items) => {
                let inner: Vec<String> = items.iter().map(Value::to_source).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Object(pairs) => {
                let inner: Vec<String> = pairs
                    .iter()
                    .map(|(key, value)| {
                        // JSON-encoding the key guarantees it reads as a
                        // string key, never as a bare identifier.
                        let key = serde_json::to_string(key)
                            .unwrap_or_else(|_| "\"\"".to_string());
                        format!("{key}: {}", value.to_source())
                    })
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Function(source) => source.clone(),
            Value::Date(epoch_ms) => format!("new Date({epoch_ms})"),
            Value::Regex { source, flags } => format!("/{source}/{flags}"),
            Value::Symbol(Some(description)) => description.clone(),
            Value::Symbol(None) => "undefined".to_string(),
        }
    }
}

fn render_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{f}")
    }
}

/// Backtick-delimited string literal. Backslashes, backticks and `${`
/// sequences are escaped so the literal always reads back verbatim.
fn render_template_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('`');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '`' => out.push_str("\\`"),
            '$' if chars.peek() == Some(&'{') => out.push_str("\\$"),
            _ => out.push(c),
        }
    }
    out.push('`');
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s}"),
            other => write!(f, "{}", other.to_source()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

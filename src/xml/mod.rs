//! XML-to-tree conversion for order exports.
//!
//! Documents are converted into a `serde_json::Value` tree: attributes become
//! string entries, child elements accumulate into arrays under their tag name,
//! and element text lands under `"#text"`. A configured set of foldable dotted
//! paths collapses single-element arrays back into scalar objects, which is
//! what the rest of the pipeline navigates.

pub mod parser;
pub mod writer;

pub use parser::{fold_path, parse_document};
pub use writer::{write_document, XML_DECLARATION};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("expected {expected} at byte {at}")]
    Expected { expected: String, at: usize },

    #[error("mismatched closing tag: expected </{expected}>, found </{found}>")]
    MismatchedTag { expected: String, found: String },

    #[error("document has no root element")]
    NoRoot,

    #[error("cannot serialize {0} as an XML node")]
    Unwritable(String),
}

/// The single logical child under `key`, unwrapping one-element arrays.
pub fn child<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value.get(key)? {
        Value::Array(items) => items.first(),
        other => Some(other),
    }
}

/// All children under `key`, whether stored folded or as an array.
pub fn children<'a>(value: &'a Value, key: &str) -> Vec<&'a Value> {
    match value.get(key) {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    }
}

/// Attribute lookup: a string entry on an element object.
pub fn attr<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Attribute lookup returning `""` when absent — the converter never stores
/// empty attributes, so callers that need "blank vs present" use [`attr`].
pub fn attr_or_empty<'a>(value: &'a Value, key: &str) -> &'a str {
    attr(value, key).unwrap_or("")
}

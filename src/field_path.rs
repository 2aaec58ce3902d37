//! Validated dotted field paths over JSON messages
//!
//! `inner.field1` is parsed once into segments and resolved against a
//! `serde_json::Value`. Resolution keeps two kinds of absence apart: the first
//! segment missing from the message, and a failure further down the path.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{GaxError, Result};

/// A non-empty dotted path such as `inner.field1`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

/// Outcome of resolving a [`FieldPath`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution<'a> {
    /// The top-level field is absent from the message
    MissingRoot,
    /// The top-level field exists but a later segment could not be followed
    Missing,
    Found(&'a Value),
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(GaxError::invalid_argument("field path must not be empty"));
        }
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(GaxError::invalid_argument(format!(
                "field path `{}` has an empty segment",
                path
            )));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The top-level field name
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    pub fn resolve<'a>(&self, message: &'a Value) -> Resolution<'a> {
        let Some(mut current) = step(message, self.root()) else {
            return Resolution::MissingRoot;
        };
        for segment in &self.segments[1..] {
            match step(current, segment) {
                Some(next) => current = next,
                None => return Resolution::Missing,
            }
        }
        Resolution::Found(current)
    }
}

fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

impl FromStr for FieldPath {
    type Err = GaxError;

    fn from_str(s: &str) -> Result<Self> {
        FieldPath::parse(s)
    }
}

impl TryFrom<&str> for FieldPath {
    type Error = GaxError;

    fn try_from(value: &str) -> Result<Self> {
        FieldPath::parse(value)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

//! Modify change sets
//!
//! A change set is either built directly from [`Modification`]s or
//! validated from a dynamic JSON mapping of the form
//!
//! ```text
//! { "givenName": ["MODIFY_REPLACE", ["Ann"]],
//!   "mail":      [[0, ["a@example.com"]], [1, []]] }
//! ```
//!
//! where each change type is a protocol code (0..=3) or one of the names
//! `MODIFY_ADD`, `MODIFY_DELETE`, `MODIFY_REPLACE`, `MODIFY_INCREMENT`.

use crate::error::{Result, SessionError};
use bytes::Bytes;
use dirproto::{ChangeType, Modification};
use serde_json::Value;

/// A validated, non-empty list of attribute changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<Modification>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<I, V>(self, attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        self.change(attribute, ChangeType::Add, values)
    }

    pub fn delete<I, V>(self, attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        self.change(attribute, ChangeType::Delete, values)
    }

    pub fn replace<I, V>(self, attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        self.change(attribute, ChangeType::Replace, values)
    }

    pub fn increment(self, attribute: &str, by: i64) -> Self {
        self.change(attribute, ChangeType::Increment, [by.to_string()])
    }

    pub fn change<I, V>(mut self, attribute: &str, change: ChangeType, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        self.changes.push(Modification::new(
            attribute,
            change,
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn modifications(&self) -> &[Modification] {
        &self.changes
    }

    pub fn into_modifications(self) -> Vec<Modification> {
        self.changes
    }

    fn validated(self) -> Result<Self> {
        if self.changes.is_empty() {
            return Err(SessionError::MalformedChangeSet(
                "no changes in modify request".into(),
            ));
        }
        Ok(self)
    }
}

/// Anything a session accepts as the changes of a modify call
pub trait IntoChangeSet {
    fn into_change_set(self) -> Result<ChangeSet>;
}

impl IntoChangeSet for ChangeSet {
    fn into_change_set(self) -> Result<ChangeSet> {
        self.validated()
    }
}

impl IntoChangeSet for Vec<Modification> {
    fn into_change_set(self) -> Result<ChangeSet> {
        ChangeSet { changes: self }.validated()
    }
}

impl IntoChangeSet for &Value {
    fn into_change_set(self) -> Result<ChangeSet> {
        let map = self.as_object().ok_or_else(|| {
            SessionError::MalformedChangeSet("changes must be a mapping".into())
        })?;

        let mut set = ChangeSet::new();
        for (attribute, change) in map {
            let pairs = match change.as_array() {
                // a list of [code, values] pairs
                Some(items) if !items.is_empty() && items.iter().all(Value::is_array) => {
                    items.iter().collect::<Vec<_>>()
                }
                _ => vec![change],
            };
            for pair in pairs {
                set.changes.push(parse_pair(attribute, pair)?);
            }
        }
        set.validated()
    }
}

impl IntoChangeSet for Value {
    fn into_change_set(self) -> Result<ChangeSet> {
        (&self).into_change_set()
    }
}

fn parse_pair(attribute: &str, pair: &Value) -> Result<Modification> {
    let items = match pair.as_array() {
        Some(items) if items.len() == 2 => items,
        _ => {
            return Err(SessionError::MalformedChangeSet(format!(
                "change for {} must be a [change type, values] pair",
                attribute
            )))
        }
    };

    let change = match &items[0] {
        Value::Number(n) => n
            .as_u64()
            .and_then(|code| u32::try_from(code).ok())
            .and_then(ChangeType::from_code),
        Value::String(name) => ChangeType::from_name(name),
        _ => None,
    }
    .ok_or_else(|| SessionError::UnknownChangeType(items[0].to_string()))?;

    let values = match &items[1] {
        Value::Array(values) => values.iter().map(value_bytes).collect(),
        Value::Null => Vec::new(),
        scalar => vec![value_bytes(scalar)],
    };

    Ok(Modification::new(attribute, change, values))
}

fn value_bytes(value: &Value) -> Bytes {
    match value {
        Value::String(s) => Bytes::from(s.clone()),
        other => Bytes::from(other.to_string()),
    }
}

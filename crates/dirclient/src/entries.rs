//! Typed view over search responses
//!
//! Search results are grouped by attribute-set signature. Each entry's
//! attribute names must be a subset of some signature; signatures are
//! tried largest first, so the most specific grouping that still covers
//! the entry wins.

use crate::error::{Result, SessionError};
use dirproto::{Attributes, Response, SearchEntry};
use std::collections::BTreeSet;
use std::fmt;

/// A set of lowercase attribute names
pub type Signature = BTreeSet<String>;

pub fn signature<I, S>(names: I) -> Signature
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| name.as_ref().to_ascii_lowercase())
        .collect()
}

/// One search result typed by the signature it matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub signature: Signature,
    pub attributes: Attributes,
}

impl Entry {
    /// All values of an attribute, matched case-insensitively
    pub fn values(&self, attribute: &str) -> &[bytes::Bytes] {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn first_str(&self, attribute: &str) -> Option<&str> {
        self.values(attribute)
            .first()
            .and_then(|value| std::str::from_utf8(value).ok())
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DN: {}", self.dn)?;
        for (name, values) in &self.attributes {
            for value in values {
                writeln!(f, "    {}: {}", name, String::from_utf8_lossy(value))?;
            }
        }
        Ok(())
    }
}

fn entry_signature(entry: &SearchEntry) -> Signature {
    signature(entry.attributes.keys())
}

/// Materialize the search entries of `responses`
///
/// With no explicit signatures, the distinct attribute sets of the
/// responses themselves are the signatures.
pub fn materialize(responses: &[Response], signatures: Option<&[Signature]>) -> Result<Vec<Entry>> {
    let found: Vec<&SearchEntry> = responses
        .iter()
        .filter_map(|response| match response {
            Response::Entry(entry) => Some(entry),
            _ => None,
        })
        .collect();

    let mut ordered: Vec<Signature> = match signatures {
        Some(signatures) => signatures.to_vec(),
        None => {
            let distinct: BTreeSet<Signature> = found.iter().map(|e| entry_signature(e)).collect();
            distinct.into_iter().collect()
        }
    };
    // Stable sort keeps the caller's order among equally sized signatures
    ordered.sort_by(|a, b| b.len().cmp(&a.len()));

    found
        .into_iter()
        .map(|entry| {
            let attributes = entry_signature(entry);
            let matched = ordered
                .iter()
                .find(|candidate| attributes.is_subset(candidate))
                .ok_or_else(|| {
                    SessionError::AttributeSetUnmatched(format!(
                        "{} with attributes {:?}",
                        entry.dn, attributes
                    ))
                })?;
            Ok(Entry {
                dn: entry.dn.clone(),
                signature: matched.clone(),
                attributes: entry.attributes.clone(),
            })
        })
        .collect()
}

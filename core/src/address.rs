//! Hierarchical addresses.
//!
//! An [`Address`] is an ordered path of segments locating a node in the tree.
//! `["root", "endpoint", "0"]` is a child of `["root", "endpoint"]`, which is a
//! child of `["root"]`. The empty address is the parent of every address.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ArborError, Result};

/// Separator used by [`Address::key`]; never allowed inside a segment.
pub const DELIMITER: char = '/';

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Address(Vec<String>);

impl Address {
    /// Builds an address, rejecting empty segments and segments containing `/`.
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self(segments))
    }

    /// The empty address.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// True when `self` is a prefix of `other` (equal addresses included).
    pub fn is_parent_of(&self, other: &Address) -> bool {
        other.0.len() >= self.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }

    /// All segments but the last; the parent of a one-segment address is the empty address.
    pub fn parent(&self) -> Address {
        let end = self.0.len().saturating_sub(1);
        Self(self.0[..end].to_vec())
    }

    /// Appends a validated segment.
    pub fn child(&self, id: &str) -> Result<Address> {
        validate_segment(id)?;
        Ok(self.join(id))
    }

    // Callers guarantee `id` was validated (child ids are checked on insertion).
    pub(crate) fn join(&self, id: &str) -> Address {
        let mut segments = self.0.clone();
        segments.push(id.to_string());
        Self(segments)
    }

    /// Moves an address below `from` to the same position below `to`.
    ///
    /// Addresses outside `from` are returned unchanged.
    pub fn rebase(&self, from: &Address, to: &Address) -> Address {
        if !from.is_parent_of(self) {
            return self.clone();
        }
        let mut segments = to.0.clone();
        segments.extend_from_slice(&self.0[from.len()..]);
        Self(segments)
    }

    /// Stable string form, usable as a map key.
    pub fn key(&self) -> String {
        self.0.join("/")
    }
}

pub(crate) fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(ArborError::InvalidAddress("empty segment".into()));
    }
    if segment.contains(DELIMITER) {
        return Err(ArborError::InvalidAddress(format!(
            "segment {segment:?} contains '{DELIMITER}'"
        )));
    }
    Ok(())
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl FromStr for Address {
    type Err = ArborError;

    /// Parses the key form (`root/endpoint/0`); a leading `/` is accepted.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches(DELIMITER);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        Self::new(trimmed.split(DELIMITER))
    }
}

impl TryFrom<Vec<String>> for Address {
    type Error = ArborError;

    fn try_from(segments: Vec<String>) -> Result<Self> {
        Self::new(segments)
    }
}

impl From<Address> for Vec<String> {
    fn from(address: Address) -> Self {
        address.0
    }
}

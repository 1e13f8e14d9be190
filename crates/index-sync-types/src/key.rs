//! Entity keys.
//!
//! A key has the form `namespace:name`. Keys are ordered by namespace first
//! and name second; both the authoritative store and the index scan in this
//! order, which is what lets the reconciler merge the two scans.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypesError;

const SEPARATOR: char = ':';

/// Namespace-qualified, totally ordered entity identifier.
///
/// The empty key sorts before every other key and is used as the
/// "nothing processed yet" sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey {
    raw: String,
    split: usize,
}

impl EntityKey {
    /// Parse a `namespace:name` key. The namespace may be empty, the name may not.
    pub fn parse(raw: impl Into<String>) -> Result<Self, TypesError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Ok(Self::empty());
        }
        let split = raw
            .find(SEPARATOR)
            .ok_or_else(|| TypesError::InvalidKey(raw.clone()))?;
        if split + 1 == raw.len() {
            return Err(TypesError::InvalidKey(raw));
        }
        Ok(Self { raw, split })
    }

    /// Build a key from its two parts.
    pub fn new(namespace: &str, name: &str) -> Result<Self, TypesError> {
        Self::parse(format!("{namespace}{SEPARATOR}{name}"))
    }

    /// The lower-bound sentinel.
    pub fn empty() -> Self {
        Self {
            raw: String::new(),
            split: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn namespace(&self) -> &str {
        &self.raw[..self.split]
    }

    pub fn name(&self) -> &str {
        if self.is_empty() {
            ""
        } else {
            &self.raw[self.split + 1..]
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Default for EntityKey {
    fn default() -> Self {
        Self::empty()
    }
}

impl Ord for EntityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.namespace()
            .cmp(other.namespace())
            .then_with(|| self.name().cmp(other.name()))
    }
}

impl PartialOrd for EntityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for EntityKey {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> Self {
        key.raw
    }
}

impl std::str::FromStr for EntityKey {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

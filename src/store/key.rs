//! Validated record keys

use std::fmt;

use crate::core::{MeshError, MeshResult};

const SEPARATOR: char = '/';

/// A `/`-separated record key
///
/// Every segment is non-empty, contains no path separator and does not start
/// with `.`, so a key always maps to a location inside the store root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey(String);

impl RecordKey {
    /// Build a single-segment key
    pub fn root(segment: &str) -> MeshResult<Self> {
        validate_segment(segment)?;
        Ok(Self(segment.to_string()))
    }

    /// Parse a full key such as `inbox/abc/123`
    pub fn parse(key: &str) -> MeshResult<Self> {
        if key.is_empty() {
            return Err(MeshError::InvalidKey(key.to_string()));
        }
        for segment in key.split(SEPARATOR) {
            validate_segment(segment).map_err(|_| MeshError::InvalidKey(key.to_string()))?;
        }
        Ok(Self(key.to_string()))
    }

    /// Append a segment
    pub fn child(&self, segment: &str) -> MeshResult<Self> {
        validate_segment(segment)?;
        Ok(Self(format!("{}{}{}", self.0, SEPARATOR, segment)))
    }

    /// Iterate over the segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// The final segment
    pub fn last(&self) -> &str {
        self.0.rsplit(SEPARATOR).next().unwrap_or(&self.0)
    }

    /// Check whether this key lies under `prefix` (or equals it)
    pub fn starts_with(&self, prefix: &RecordKey) -> bool {
        match self.0.strip_prefix(prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with(SEPARATOR),
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_segment(segment: &str) -> MeshResult<()> {
    let valid = !segment.is_empty()
        && !segment.starts_with('.')
        && !segment
            .chars()
            .any(|c| c == SEPARATOR || c == '\\' || c == '\0' || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(MeshError::InvalidKey(segment.to_string()))
    }
}

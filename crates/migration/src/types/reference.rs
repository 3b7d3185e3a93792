use std::fmt;

use serde::{Deserialize, Serialize};

/// A parsed `Type/id[|authority]` reference string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParsedReference {
    pub resource_type: String,
    pub id: String,
    /// Explicit authority suffix, if the reference carried one.
    pub source_assigning_authority: Option<String>,
}

impl ParsedReference {
    /// Parses a reference string.
    ///
    /// Absolute references keep only their last two path segments. Contained
    /// (`#id`) and malformed references return `None`.
    pub fn parse(reference: &str) -> Option<Self> {
        if reference.starts_with('#') {
            return None;
        }
        let (path, authority) = match reference.split_once('|') {
            Some((path, authority)) => (path, Some(authority)),
            None => (reference, None),
        };
        let (prefix, id) = path.rsplit_once('/')?;
        let resource_type = prefix.rsplit('/').next().unwrap_or(prefix);
        if resource_type.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            source_assigning_authority: authority
                .filter(|a| !a.is_empty())
                .map(str::to_string),
        })
    }

    /// Builds a reference without an authority suffix.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            source_assigning_authority: None,
        }
    }

    /// Returns a copy carrying the given authority suffix.
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        let authority = authority.into();
        self.source_assigning_authority = (!authority.is_empty()).then_some(authority);
        self
    }

    /// True if the reference carries an explicit `|authority` suffix.
    pub fn has_authority(&self) -> bool {
        self.source_assigning_authority.is_some()
    }

    /// `Type/id` without any authority suffix.
    pub fn type_and_id(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for ParsedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)?;
        if let Some(authority) = &self.source_assigning_authority {
            write!(f, "|{authority}")?;
        }
        Ok(())
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix every resource collection carries for the FHIR version it stores.
pub const VERSION_SUFFIX: &str = "_4_0_0";

/// Suffix of the append-only version log paired with each resource collection.
pub const HISTORY_SUFFIX: &str = "_History";

/// A physical collection name such as `Patient_4_0_0` or `Patient_4_0_0_History`.
///
/// Partitioned collections (`AuditEvent_4_0_0_2023_01`) keep their suffix in
/// [`CollectionName::as_str`] but still report the base resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionName(String);

impl CollectionName {
    /// Wraps an existing collection name.
    pub fn parse(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the main collection for a resource type.
    pub fn main(resource_type: &str) -> Self {
        Self(format!("{resource_type}{VERSION_SUFFIX}"))
    }

    /// Returns the history collection for a resource type.
    pub fn history(resource_type: &str) -> Self {
        Self(format!("{resource_type}{VERSION_SUFFIX}{HISTORY_SUFFIX}"))
    }

    /// Returns the raw collection name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for version-history collections.
    pub fn is_history(&self) -> bool {
        self.0.ends_with(HISTORY_SUFFIX)
    }

    /// The resource type stored in this collection (everything before the first `_`).
    pub fn resource_type(&self) -> &str {
        self.0.split('_').next().unwrap_or(&self.0)
    }

    /// The history collection paired with this main collection.
    pub fn to_history(&self) -> Self {
        if self.is_history() {
            self.clone()
        } else {
            Self(format!("{}{HISTORY_SUFFIX}", self.0))
        }
    }

    /// The main collection paired with this history collection.
    pub fn to_main(&self) -> Self {
        match self.0.strip_suffix(HISTORY_SUFFIX) {
            Some(main) => Self(main.to_string()),
            None => self.clone(),
        }
    }

    /// Field prefix for resource fields in this collection's documents.
    ///
    /// History documents wrap the resource under `resource`.
    pub fn field_prefix(&self) -> &'static str {
        if self.is_history() { "resource." } else { "" }
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionName {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for CollectionName {
    fn from(value: String) -> Self {
        Self::parse(value)
    }
}

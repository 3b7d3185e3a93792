//! Core types shared by every stage of a migration.
//!
//! - [`DocumentId`], [`StoredDocument`] - raw documents as the store hands them out
//! - [`CollectionName`] - `<Type>_4_0_0[_History]` naming
//! - [`ParsedReference`] - `Type/id|authority` reference strings
//! - [`IdentityTuple`] - `(sourceId, sourceAssigningAuthority, uuid)` and UUIDv5 derivation
//! - [`security`] - tag and identifier system constants
//!
//! # Examples
//!
//! ```
//! use helios_migration::types::{CollectionName, IdentityTuple, ParsedReference};
//!
//! let collection = CollectionName::parse("Observation_4_0_0_History");
//! assert!(collection.is_history());
//! assert_eq!(collection.resource_type(), "Observation");
//!
//! let reference = ParsedReference::parse("Patient/123|client").unwrap();
//! assert_eq!(reference.source_assigning_authority.as_deref(), Some("client"));
//!
//! let a = IdentityTuple::derive("A.B-1", "thedacare");
//! let b = IdentityTuple::derive("A.B-1", "thedacare");
//! assert_eq!(a.uuid, b.uuid);
//! ```

mod collection;
mod document;
mod identity;
mod reference;
pub mod security;

pub use collection::{CollectionName, HISTORY_SUFFIX, VERSION_SUFFIX};
pub use document::{DocumentId, StoredDocument};
pub use identity::{IdentityTuple, derive_uuid, is_uuid, sanitize_id};
pub(crate) use identity::truncate_id;
pub use reference::ParsedReference;

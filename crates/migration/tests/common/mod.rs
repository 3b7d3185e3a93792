//! Test infrastructure for migration runs.
//!
//! Builds FHIR documents carrying the identity fields the server stores and
//! runs migrations against an in-memory store.

#![allow(dead_code)]

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;

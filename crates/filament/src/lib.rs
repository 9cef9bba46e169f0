//! `filament` is the core object model for networked functional
//! endpoints.
//!
//! A functional endpoint is an addressable control and monitoring
//! surface exposing typed properties, methods, and children. Properties
//! are partitioned into sections with distinct visibility and
//! persistence rules, identified by string keys, and carried on the
//! wire as a small sum type of values.
//!
//! This crate holds everything the device side and the controller side
//! share:
//!
//! - the wire [`value`](crate::value) model and typed coercion,
//! - [`section`](crate::section)s and typed property/method
//!   [`key`](crate::key)s,
//! - path-based [`uri`](crate::uri) addressing,
//! - the automation [`expr`](crate::expr)ession language: a minimal,
//!   stack-based program format used by pairing transforms, rule
//!   conditions, and timer schedules.
//!
//! The runtime halves live in sibling crates: `filament-endpoint`
//! hosts local endpoints and mirrors remote ones, and
//! `filament-automation` reacts to property changes in-band, without
//! cloud involvement.

#![deny(unsafe_code)]
#![deny(missing_docs)]

/// Error types shared across the object model.
pub mod error;
/// The automation expression language.
pub mod expr;
/// Typed property and method keys.
pub mod key;
/// Property sections.
pub mod section;
/// Path-based resource addressing.
pub mod uri;
/// Wire values and typed coercion.
pub mod value;

use serde::Serialize;

/// Serializes a value into its JSON representation.
///
/// Serialization of the model types in this workspace is infallible;
/// a failure here indicates a bug and collapses to `Null` after being
/// logged.
pub fn serialize<T: Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        log::error!("Serialization failure: {e}");
        serde_json::Value::Null
    })
}

/// Deserializes a value from its JSON representation.
///
/// # Panics
///
/// Panics when the JSON does not represent the requested type; meant
/// for tests and trusted persisted state.
#[cfg(feature = "deserialize")]
pub fn deserialize<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
    serde_json::from_value(value).expect("deserialization failure")
}

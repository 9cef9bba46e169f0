//! `filament-automation` lets filament endpoints react to each other
//! in-band, without cloud involvement.
//!
//! Three primitives, owned by the [`manager::AutomationManager`]:
//!
//! - [`pairing::Pairing`] mirrors a property between two locations,
//!   optionally transforming values per direction;
//! - [`rule::Rule`] evaluates a condition set and fires an action list
//!   on the false-to-true edge of the combined result;
//! - [`timer::Timer`] fires actions on a computed schedule, gated by a
//!   predicate.
//!
//! Transforms, conditions, schedules, and predicates are automation
//! expressions, the minimal stack language from [`filament::expr`].
//! They are authored by users and therefore untrusted: a failing
//! program means "no propagation this cycle" and never crashes the
//! manager.
//!
//! Every primitive reads and writes properties through the endpoint
//! capability interface, so automation works identically whether the
//! endpoints involved are local or mirrored from across the network.
//! Each primitive is itself hosted as an endpoint, making its
//! configuration and execution state addressable and observable
//! through the same property model.

#![deny(unsafe_code)]
#![deny(missing_docs)]

/// Actions fired by rules and timers.
pub mod action;
/// Property-location addressing and resolution.
pub mod address;
/// Error management.
pub mod error;
/// The automation primitive owner.
pub mod manager;
/// Property mirroring between two locations.
pub mod pairing;
/// Condition sets firing action lists.
pub mod rule;
/// Scheduled, predicate-gated actions.
pub mod timer;

//! `filament-endpoint` is the runtime half of the filament object
//! model: it hosts functional endpoints in-process and mirrors
//! remotely-hosted ones over a message transport.
//!
//! A functional endpoint exposes typed properties partitioned into
//! sections, named methods, and children, through one capability
//! interface, [`endpoint::Endpoint`], implemented identically by:
//!
//! - [`local::LocalEndpoint`], which owns canonical state composed
//!   from [`handler::TraitHandler`] implementations,
//! - [`remote::RemoteEndpoint`], a proxy mirroring a remote endpoint's
//!   sections through caching and observation subscriptions,
//! - [`group::Group`], a composite fanning state operations out to a
//!   member set.
//!
//! Callers cannot distinguish the variants except by latency and
//! failure modes, which keeps automation written against the interface
//! working unchanged wherever the endpoint actually lives.
//!
//! The network is consumed as a black box through the
//! [`transport::Transport`] seam; [`transport::LoopbackTransport`]
//! routes requests to a [`registry::Registry`] in-process, standing in
//! for a real transport in tests and single-process deployments.

#![deny(unsafe_code)]
#![deny(missing_docs)]

/// The endpoint capability interface.
pub mod endpoint;
/// Error management.
pub mod error;
/// Group endpoints fanning operations out to members.
pub mod group;
/// Trait handlers composed into local endpoints.
pub mod handler;
/// Listener streams and change events.
pub mod listener;
/// The locally-hosted endpoint runtime.
pub mod local;
/// The registry owning hosted endpoints and groups.
pub mod registry;
/// The remote-endpoint proxy.
pub mod remote;
/// The transport and transaction abstraction.
pub mod transport;

//! Core types and wire contracts for the ePoxy network boot orchestrator.
//!
//! ePoxy drives physically managed servers through a multi-stage boot
//! sequence. This crate holds everything both sides of that conversation
//! agree on, with no network I/O of its own:
//!
//! - [`host`]: host records and the per-boot session authority
//! - [`store`]: the durable host-record store contract and implementations
//! - [`compose`]: stage-1 iPXE and stage-1/2/3 action composition
//! - [`action`]: the JSON action document and its normalization rules
//! - [`kargs`]: kernel command-line parsing
//! - [`template`]: the `{{ }}` template language of action documents
//! - [`shellwords`]: shell-style splitting for command strings
//! - [`extension`]: the envelope and registry for extension services
//!
//! The `epoxy-server` binary builds the HTTP surface on top of these; the
//! `epoxy-client` binary interprets action documents on booting machines.

pub mod action;
pub mod compose;
pub mod extension;
pub mod host;
pub mod kargs;
pub mod shellwords;
pub mod store;
pub mod template;

pub use action::{Action, ActionError, CommandEntry, V1, VarValue};
pub use extension::{ExtensionRegistry, ExtensionRequest, ExtensionV1};
pub use host::{Host, SessionIds};
pub use kargs::Kargs;
pub use store::{HostStore, MemoryStore, SqliteStore, StoreError};

//! Multi-group Raft runtime: the embeddable engine around the sans-io `raft` crate and the
//! durable `journal` crate.
//!
//! The workspace follows the same layering the teacher crate used for a single Redis server,
//! generalized to many independent Raft groups sharing one process and one listening socket: a
//! length-prefixed framer and hand-rolled wire codec below, a peer connection directory and a
//! per-group consensus wrapper in the middle, and a single-threaded dispatcher loop exposing the
//! embedding API on top.

#[macro_use]
mod macros;

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod framer;
pub mod group;
pub mod multi;
pub mod registry;
pub mod rendezvous;
pub mod tasks;
pub mod wire;

pub use dispatcher::{ApplyCallback, Engine};

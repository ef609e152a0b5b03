//! Host-node client for the breakwater HTLC admission controller.
//!
//! The daemon talks to its Lightning node through the [`LndClient`] trait:
//! identity and channel queries, the HTLC event stream, and the bidirectional
//! interceptor stream. Two implementations ship: [`LndRestClient`] for a real
//! node's REST proxy, and [`StubLndClient`], a self-contained synthetic host
//! for demos and development.

#![forbid(unsafe_code)]

mod client;
mod rest;
mod stub;
mod types;

pub use client::*;
pub use rest::*;
pub use stub::*;
pub use types::*;

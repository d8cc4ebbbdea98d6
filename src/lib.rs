//! Concierge is a host-side session and routing layer for servers that
//! expose tools, resources, and prompts over a message-passing protocol.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`transport`] moves opaque frames over in-process pipes, child-process
//!   stdio, or HTTP, behind one trait.
//! - [`codec`] encodes and decodes the JSON-RPC shaped envelopes that travel
//!   inside those frames.
//! - [`session`] owns one connection per server: negotiation, request
//!   correlation, deadlines, cancellation, and close fan-out.
//! - [`registry`] aggregates declared capabilities under arena handles so
//!   identically named entries on different servers never collide.
//! - [`router`] is the host core: capability operations out, demultiplexed
//!   server-originated traffic in.
//! - [`elicitation`] resolves user-preference questions to exactly one of
//!   three outcomes.
//! - [`reasoning`] is the adapter seam everything requiring judgment goes
//!   through.
//!
//! The binary (`src/main.rs`) wires a configured set of servers into a
//! [`router::Host`] and exposes the aggregated catalog.

pub mod codec;
pub mod config;
pub mod elicitation;
pub mod error;
pub mod logging;
pub mod reasoning;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

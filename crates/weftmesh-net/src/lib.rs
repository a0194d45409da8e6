//! weftmesh-net
//!
//! Invite & signaling envelopes (C3), the connection manager (C4), and the
//! message dispatcher (C5) for the weftmesh friend-to-friend mesh.
//!
//! # Modules
//!
//! - [`envelope`]: pack/unpack invite and answer codes.
//! - [`connection`]: per-`(group, peer)` channel lifecycle tracking.
//! - [`dispatch`]: classify, deduplicate, and route inbound messages.
//! - [`error`]: error types.

pub mod connection;
pub mod dispatch;
pub mod envelope;
pub mod error;

pub use connection::{Channel, ChannelKey, ChannelState, ConnectionEvent, ConnectionManager};
pub use dispatch::{ControlMessage, Dispatcher};
pub use error::{DispatchError, EnvelopeError};

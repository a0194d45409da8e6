//! weftmesh-overlay
//!
//! Overlay Relay (C9): a standalone UDP service for connection
//! load-broadcast, redirect, and shutdown-migration traffic between
//! syncshell relay nodes.
//!
//! # Modules
//!
//! - [`relay`]: wire format and relay state.
//! - [`config`]: CLI configuration.
//! - [`error`]: error types.

pub mod config;
pub mod error;
pub mod relay;

pub use config::Config;
pub use error::OverlayError;
pub use relay::{CapacityDecision, OverlayMessage, Relay};

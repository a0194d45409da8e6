//! weftmesh-roster
//!
//! In-memory roster state (C6): who is in a group, who hosts it, and each
//! member's cached mod-data snapshot, with an event stream fanning out
//! every mutation.
//!
//! # Modules
//!
//! - [`roster`]: `RosterManager` and the `RosterEvent` stream.
//! - [`error`]: error types.

pub mod error;
pub mod roster;

pub use error::{Error, Result};
pub use roster::{
    normalize_group_id, MemberChangeKind, Roster, RosterChangeKind, RosterEvent, RosterManager,
    MOD_CACHE_TTL,
};

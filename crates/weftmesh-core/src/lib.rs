//! weftmesh-core
//!
//! Shared data-model types, canonical JSON encoding, and cryptographic
//! primitives for the weftmesh friend-to-friend mesh.
//!
//! # Modules
//!
//! - [`types`]: phonebook entries, tombstones, manifests, invite payloads.
//! - [`canonical`]: deterministic JSON serialization for hashing/signing.
//! - [`crypto`]: group key derivation, Ed25519 signing, HMAC tags, content hashing.
//! - [`error`]: error types.

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use types::*;

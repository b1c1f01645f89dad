//! Shared infrastructure for the warren overlay network: libsodium
//! primitives, key material handling, logging bootstrap and time helpers.

pub mod crypto;
pub mod encoding;
pub mod keys;
pub mod logging;
pub mod time;

//! Infrastructure layer for Weave.
//!
//! Contains implementations of the ports defined in `weave-core`: the
//! SQLite execution store and webhook authentication.

pub mod sqlite;
pub mod webhook;

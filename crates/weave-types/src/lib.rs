//! Shared domain types for Weave.
//!
//! This crate contains the core domain types used across the Weave engine:
//! workflow definitions, execution instances, step records, and store errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod instance;
pub mod workflow;

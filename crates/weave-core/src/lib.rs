//! Workflow engine core: graph compilation, expression evaluation,
//! the instance scheduler, and trigger dispatch.
//!
//! This crate defines the "ports" (the execution store and capability
//! invoker traits) that the infrastructure layer implements. It depends
//! only on `weave-types` -- never on `weave-infra` or any database/IO
//! crate.

pub mod cron;
pub mod definition;
pub mod expr;
pub mod graph;
pub mod path;
pub mod retry;
pub mod scheduler;
pub mod step;
pub mod store;
pub mod trigger;

//! HTTP request handlers.

pub mod definition;
pub mod instance;
pub mod webhook;

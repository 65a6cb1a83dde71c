//! Shared helpers.
//!
//! Stateless building blocks used by connectors, lock backends and binaries.

pub mod bootstrap;
pub mod retry;

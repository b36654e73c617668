//! transcode-server library crate.
//!
//! Exposes the HTTP surface and its supporting registry/config/collaborator
//! glue for integration testing.

pub mod api;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod logging;
pub mod registry;

pub use error::{Error, Result};

//! HTTP API module: the axum surface over `SourceRegistry`/`StreamSupervisor`.

pub mod error;
pub mod routes;
pub mod server;

pub use server::ApiServer;

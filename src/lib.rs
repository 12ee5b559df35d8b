//! Patient check-in portal backed by the drchrono records API.

pub mod appointments;
pub mod clock;
pub mod config;
pub mod error;
pub mod intake;
pub mod logging;
pub mod mirror;
pub mod models;
pub mod oauth;
pub mod records_api;
pub mod server;
pub mod session;
pub mod store;
pub mod token_store;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{PortalError, PortalResult};
pub use server::{build_router, AppState};

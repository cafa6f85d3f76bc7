//! HTTP surface consumed by the dashboard collaborator

mod routes;
mod server;

pub use server::{ApiServer, AppState};

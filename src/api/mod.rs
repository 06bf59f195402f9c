//! HTTP surface: ingress protocol endpoints, client key auth, and the
//! admin contracts the core consumes.

pub mod admin;
pub mod auth;
pub mod ingress;
pub mod routes;

pub use routes::{serve, AppState};

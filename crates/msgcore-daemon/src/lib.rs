//! `msgcore-daemon` library target.
//!
//! Exposes the router, state, and worker wiring for integration tests; the
//! binary `main.rs` depends on this library target.

pub mod api_types;
pub mod routes;
pub mod schema;
pub mod state;
pub mod workers;

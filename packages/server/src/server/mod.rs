// HTTP server setup (Axum)
pub mod app;
pub mod error;
pub mod middleware;
pub mod routes;

pub use app::*;

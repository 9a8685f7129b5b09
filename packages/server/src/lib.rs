// Intelligence Distribution Core - HTTP surface
//
// Exposes the distribution core (event bus, streaming connections, webhook
// delivery, batch orchestration) over an Axum server. All distribution
// semantics live in the `distributor` crate; this crate is wiring, auth,
// and serialization at the HTTP boundary.

pub mod config;
pub mod server;

pub use config::*;

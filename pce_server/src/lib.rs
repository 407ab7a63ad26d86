//! Router construction for the PCE control-plane server, exposed as a
//! library so integration tests can drive the full HTTP surface.

pub mod routes;

pub use routes::router;

//! The HTTP surface.
//!
//! Read endpoints expose the engine, cache, matcher, client and journal
//! state; write endpoints trigger cycles, rollbacks, resets and
//! configuration reloads. Bad inputs return 400; everything returns 503
//! until the application finishes initializing.
pub mod handlers;
pub mod routes;

pub use routes::router;

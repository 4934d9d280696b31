//! Delivery layer: the HTTP observability and operations surface.
pub mod http;

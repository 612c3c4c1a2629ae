//! HTTP surface: health, WebSocket upgrade and room administration

pub mod middleware;
pub mod routes;

pub use routes::build_router;

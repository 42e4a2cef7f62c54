//! HTTP and WebSocket handlers mounted by [`crate::server::router`].

pub(crate) mod api;
pub(crate) mod middleware;
mod prelude;
pub mod rpc;
pub(crate) mod ws;

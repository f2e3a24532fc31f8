//! Rate-limiting, response-caching HTTP gateway.
//!
//! [`pipeline::GatewayPipeline`] composes per-client admission control
//! ([`registry::ClientRegistry`]) with a GET response cache
//! ([`cache::ResponseCache`]) into middleware installable ahead of any axum
//! router. [`server`] wires it in front of the user service routes.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod state;

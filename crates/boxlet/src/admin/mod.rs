//! Admin channel: an HTTP side listener in the proxy exposing per-route
//! stats, group occupancy and health. Every endpoint requires the bearer
//! token configured for the proxy.

mod routes;
mod server;

pub use routes::{AdminState, GroupsResponse, HealthResponse, routes};
pub use server::serve;

//! HTTP API: routing, identity middleware, route guards and error mapping.

pub mod app;
pub mod authz;
pub mod context;
pub mod middleware;

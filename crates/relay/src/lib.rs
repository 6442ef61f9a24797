pub mod api;
pub mod app;
pub mod cleanup;
pub mod config;
pub mod cors;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod rooms;
pub mod store;
pub mod ws;

//! Multi-tenant messaging automation: webhook ingestion, tagging,
//! AI replies and outbound delivery.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod providers;
pub mod routes;
pub mod store;

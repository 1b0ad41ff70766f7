//! # Observability
//!
//! Prometheus metrics for the controller. Scraped via the HTTP server's
//! `/metrics` endpoint.

pub mod metrics;

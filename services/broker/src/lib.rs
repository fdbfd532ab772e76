//! Broker service library crate.
//!
//! Exposes the service subsystems (config, observability, TCP transport) for
//! use by the broker binary and integration tests.
pub mod config;
pub mod observability;
pub mod transport;

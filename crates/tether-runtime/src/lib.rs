//! `tether-runtime` – Process Setup
//!
//! Everything a tether process needs around the middleware.
//!
//! # Modules
//!
//! - [`node`] – [`NodeRuntime`][node::NodeRuntime]: a named node that
//!   creates publishers, subscribers and services in its [`Context`] and
//!   releases them all on shutdown.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber, optionally exporting spans over OTLP.
//!
//! [`Context`]: tether_middleware::Context

pub mod node;
pub mod telemetry;

pub use node::NodeRuntime;
pub use telemetry::{TracerProviderGuard, init_tracing};

//! Gantry Observability - logging and trace export for the gantry crates
//!
//! Sets up a `tracing` subscriber with an env filter, console output and
//! (optionally) OTLP span export, and provides span helpers for tool calls and
//! MCP requests.
//!
//! # Quick Start
//!
//! ```no_run
//! use gantry_observability::{init, ObservabilityConfig};
//!
//! let config = ObservabilityConfig::new("gantry")
//!     .with_log_level("gantry_toolbus=debug,info");
//! init(config)?;
//!
//! tracing::info!("Service started");
//! # Ok::<(), gantry_observability::ObservabilityError>(())
//! ```
//!
//! # Environment Variables
//!
//! - `OTEL_SERVICE_NAME` or `SERVICE_NAME` - Service name
//! - `OTEL_SERVICE_VERSION` or `SERVICE_VERSION` - Service version
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - OTLP endpoint
//! - `GANTRY_LOG` or `RUST_LOG` - Log filter

pub mod config;
pub mod error;
pub mod telemetry;
pub mod spans;

pub use config::ObservabilityConfig;
pub use error::ObservabilityError;
pub use telemetry::{init, init_from_env, shutdown};
pub use spans::{record_duration, record_error};

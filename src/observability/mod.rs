//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs     (structured tracing events)
//!     → metrics.rs     (counters, gauges, histograms)
//!     → request_log.rs (one record per exchange)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint
//!     → request_log target (any ExchangeSink)
//! ```
//!
//! # Design Decisions
//! - The request logger is passed explicitly, never reached globally
//! - Logging is an observer: a full buffer drops records, nothing fails
//! - Metrics are no-ops until an exporter is installed

pub mod logging;
pub mod metrics;
pub mod request_log;

pub use request_log::{Direction, ExchangeRecord, ExchangeSink, MemorySink, RequestLogger, TracingSink};

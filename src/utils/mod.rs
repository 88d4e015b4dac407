pub mod error;
pub mod logger;
pub mod metrics;

pub use error::{Result, SyncError};
pub use logger::setup_logging;
pub use metrics::{MetricsCollector, RateWindow, TransferMetrics};

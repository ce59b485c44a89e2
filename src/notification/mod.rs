// ============================================================================
// Change Notification - from "events appended" to ordered per-stream work
// ============================================================================

pub mod aggregator;
pub mod ordering;

pub use aggregator::{ChangeNotificationAggregator, PendingOperation};
pub use ordering::{OrderingReport, StreamBatch, StreamBatchHandler, StreamOrderingHandler, StreamProcessingError};

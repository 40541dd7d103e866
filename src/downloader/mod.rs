pub mod aggregator;
pub mod finalize;
pub mod manager;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod segment;
pub mod task;
pub mod task_slot_pool;
pub mod tree;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::rollup_status;
pub use finalize::{finalize_download, MergeError};
pub use manager::DownloadManager;
pub use progress::SpeedCalculator;
pub use rate_limit::SpeedLimiter;
pub use retry::{RetryDecision, RetryPolicy};
pub use segment::{DownloadWorkerTask, SegmentPlanner, WorkerStatus};
pub use task::{DownloadStatus, DownloadTask, DownloadTaskNode, MediaType};
pub use task_slot_pool::{TaskSlot, TaskSlotPool};
pub use tree::{RemovedSubtree, StatusChange, TaskTree};

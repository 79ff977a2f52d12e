pub mod engine;
pub mod forward;
pub mod local_queue; // System A: device-local queue, history and failed list
pub mod pending; // System B: pending-sync index over the cache
pub mod webhook;

// Re-export commonly used types
pub use engine::{CycleReport, EngineStatus, SignInOutcome, SkipReason, SyncEngine, Trigger};
pub use local_queue::{DrainOutcome, ForwardOutcome, LocalQueue, QueueLimits};
pub use pending::{PendingIndex, PendingSync, SyncCounts};
pub use webhook::{deliver_confirmation, Delivery, WebhookCounts, WebhookRetry};

pub mod report;
pub mod rewards;

pub use report::{
    AnonymousId, DeliveryPreference, DmfStatus, FailedReport, HarvestPayload, HistoryEntry, Owner,
    QueuedReport, ReportId, SpeciesCounts, StoredReport, Unsynced, UserId,
};
pub use rewards::{LocalDrawingEntry, RewardsEntry};

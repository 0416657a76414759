pub mod age;
pub mod engine;
pub mod listing;
pub mod monitor;
pub mod scanner;
pub mod timespec;

pub use age::Age;
pub use engine::{Candidate, Decision, Direction, SyncConfig, SyncEngine, SyncReport};
pub use listing::{Listing, ListingBlock, ListingEntry, Platform};
pub use monitor::{
    decide_to_pull, should_retrieve, JobMonitor, JobStatus, MonitorPolicy, QueueState,
    QueueSystem, RunMode, RunOutcome, Slurm, WatchOutcome,
};
pub use scanner::{ScanEntry, TreeScanner};
pub use timespec::parse_time;

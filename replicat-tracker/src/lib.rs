pub mod errors;
pub mod fs;
pub mod memory;
pub mod object;
pub mod reconcile;
pub mod rename;
pub mod stats;
pub mod tracker;
pub mod tree;

pub use errors::{Result, TrackerError};
pub use fs::FilesystemTracker;
pub use memory::InMemoryTracker;
pub use object::{MemoryBucket, ObjectBackend, ObjectMeta, ObjectNotification, ObjectStoreTracker};
pub use reconcile::{reconcile, NeededFile, ReconcilePlan};
pub use rename::{RenameInProgress, RENAME_TIMEOUT};
pub use stats::{Statistic, Statistics};
pub use tracker::{
    ChangeListener, EventRelay, NullListener, NullRelay, StorageTracker, UploadBody, MAX_ATTEMPTS,
    RETRY_DELAY,
};
pub use tree::TreeModel;

pub mod config;
pub mod errors;
pub mod membership;
pub mod node;

pub use config::{ConfigFile, Settings};
pub use errors::{DaemonError, Result};
pub use membership::{MembershipWorker, HEARTBEAT_INTERVAL};
pub use node::{run, STATS_INTERVAL};

pub mod broadcast;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod ownership;
pub mod server;

pub use broadcast::Broadcaster;
pub use client::{Credentials, PeerClient};
pub use cluster::{ClusterView, MEMBERSHIP_QUEUE};
pub use errors::{NetError, Result};
pub use ownership::{OwnershipLedger, OWNERSHIP_TTL};
pub use server::{serve, AppState, RECENT_EVENTS};

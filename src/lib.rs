//! Replicat integration tests and workspace root
//!
//! This crate serves as the root of the Replicat workspace and contains
//! integration tests that exercise whole nodes talking over real HTTP.

// Re-export the member crates under short names for integration tests
pub use replicat_daemon as daemon;
pub use replicat_net as net;
pub use replicat_proto as proto;
pub use replicat_tracker as tracker;

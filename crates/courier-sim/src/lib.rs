//! Multi-node scenarios: several coordinators sharing one database file,
//! the way a cluster of courier nodes shares its message store.

pub mod cluster;
pub mod scenarios;

pub use cluster::{SimCluster, SimError};

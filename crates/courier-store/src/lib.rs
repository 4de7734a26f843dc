//! Persistent message log and pull-claim queue shared by every cluster node.
//!
//! Every node opens its own [`SqliteStore`] on the same database file. The
//! claim-next primitive relies on SQLite's write lock, never on in-process
//! mutexes, to hand a waiting message to at most one caller.

pub mod error;
pub mod records;
mod schema;
pub mod sqlite;

pub use error::StoreError;
pub use records::{
    ClaimCandidate, ClaimChange, ClaimOutcome, ClaimState, MessageRecord, PullClaim, StatusUpdate,
};
pub use sqlite::SqliteStore;

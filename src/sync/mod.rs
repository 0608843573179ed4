//! Offline sync: operation queue, replay, refresh and the background coordinator
//!
//! - `queue`: durable pending operations in replay order
//! - `replay`: dispatch and atomic reconciliation
//! - `engine`: the queue drain
//! - `refresh`: server snapshots, conflict detection and resolution
//! - `coordinator`: background loop

pub mod coordinator;
pub mod engine;
pub mod queue;
pub mod refresh;
pub mod replay;

pub use coordinator::SyncCoordinator;
pub use engine::{DrainReport, SyncEngine};
pub use queue::{OperationAction, OperationQueue, OperationType, PendingOperation};
pub use refresh::{EntityRefresh, Refresher};
pub use replay::{Reconciled, Replayer};

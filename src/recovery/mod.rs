//! Failure classification, retry policy and recovery plans

pub mod manager;
pub mod plan;
pub mod policy;

pub use manager::{FailureOutcome, RecoveryManager, RecoveryOutcome, TickReport};
pub use plan::{FailedOperation, Modifications, PlanStatus, RecoveryPlan};
pub use policy::{ErrorRecord, ErrorType, RetryPolicy, Strategy};

//! Failure taxonomy, strategy table and retry backoff

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sync::queue::PendingOperation;
use crate::transport::TransportError;

/// Failure class derived from transport signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// No response received
    Network,
    Timeout,
    /// 401/403
    Auth,
    /// 400/422
    Validation,
    /// 5xx, 429
    Server,
    /// 409
    Conflict,
    Unknown,
}

impl ErrorType {
    pub fn classify(err: &TransportError) -> Self {
        match err {
            TransportError::Unreachable(_) => ErrorType::Network,
            TransportError::Timeout(_) => ErrorType::Timeout,
            TransportError::Status { status, .. } => match *status {
                401 | 403 => ErrorType::Auth,
                400 | 422 => ErrorType::Validation,
                408 => ErrorType::Timeout,
                409 => ErrorType::Conflict,
                429 => ErrorType::Server,
                500..=599 => ErrorType::Server,
                _ => ErrorType::Unknown,
            },
            TransportError::InvalidResponse(_) => ErrorType::Unknown,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorType::Network => "network",
            ErrorType::Timeout => "timeout",
            ErrorType::Auth => "auth",
            ErrorType::Validation => "validation",
            ErrorType::Server => "server",
            ErrorType::Conflict => "conflict",
            ErrorType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// How a failed operation gets recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Re-dispatch after backoff
    Retry,
    /// Replace with a fresh queue entry (optionally with corrected payload)
    Requeue,
    /// Needs a credential refresh
    Escalate,
    /// Needs a payload correction
    Modify,
    /// Needs an operator decision
    Manual,
}

impl Strategy {
    /// Strategies the background tick may run on its own.
    pub fn is_automatic(self) -> bool {
        matches!(self, Strategy::Retry | Strategy::Requeue)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "retry" => Some(Strategy::Retry),
            "requeue" => Some(Strategy::Requeue),
            "escalate" => Some(Strategy::Escalate),
            "modify" => Some(Strategy::Modify),
            "manual" => Some(Strategy::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::Retry => "retry",
            Strategy::Requeue => "requeue",
            Strategy::Escalate => "escalate",
            Strategy::Modify => "modify",
            Strategy::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Backoff and attempt limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub factor: u32,
    pub max_delay_ms: u64,
    /// Failures after which every strategy becomes manual
    pub max_attempts: u32,
    /// Retries granted to unclassified failures
    pub unknown_retry_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            factor: 2,
            max_delay_ms: 60_000,
            max_attempts: 5,
            unknown_retry_limit: 2,
        }
    }
}

impl RetryPolicy {
    /// `min(base * factor^retry_count, cap)` in milliseconds.
    pub fn delay_ms(&self, retry_count: u32) -> i64 {
        let multiplier = u64::from(self.factor)
            .checked_pow(retry_count)
            .unwrap_or(u64::MAX);
        let delay = self
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);
        i64::try_from(delay).unwrap_or(i64::MAX)
    }

    /// Whether a scheduled retry may run at `now`.
    pub fn backoff_elapsed(&self, op: &PendingOperation, now: i64) -> bool {
        if !op.is_scheduled_retry() {
            return true;
        }
        match op.last_attempt_at {
            Some(last) => now.saturating_sub(last) >= self.delay_ms(op.retry_count),
            None => true,
        }
    }

    /// Strategy for a failure, given the number of failed attempts so far (including this one).
    pub fn strategy_for(&self, error_type: ErrorType, attempts: u32) -> Strategy {
        if attempts >= self.max_attempts {
            return Strategy::Manual;
        }
        match error_type {
            ErrorType::Network | ErrorType::Timeout | ErrorType::Server => Strategy::Retry,
            ErrorType::Auth => Strategy::Escalate,
            ErrorType::Validation => Strategy::Modify,
            ErrorType::Conflict => Strategy::Manual,
            ErrorType::Unknown if attempts <= self.unknown_retry_limit => Strategy::Retry,
            ErrorType::Unknown => Strategy::Manual,
        }
    }
}

/// Structured record of one failure, persisted for the recovery UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    #[serde(default)]
    pub status: Option<u16>,
    pub error_type: ErrorType,
    pub timestamp: i64,
    pub operation_id: String,
    #[serde(default)]
    pub operation_type: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ErrorRecord {
    pub fn from_failure(op: &PendingOperation, err: &TransportError, now: i64) -> Self {
        Self {
            message: err.to_string(),
            status: err.status(),
            error_type: ErrorType::classify(err),
            timestamp: now,
            operation_id: op.id.clone(),
            operation_type: Some(op.operation_type.to_string()),
            endpoint: Some(op.target_endpoint.clone()),
        }
    }
}

//! Failure taxonomy for crawl attempts.
//!
//! Transport problems and upstream throttling are retryable within the task's
//! retry budget; other upstream 4xx responses are permanent. The worker pool
//! feeds rate-limit failures to the governor as throttle signals.

use serde::{Deserialize, Serialize};

/// A malformed status or source token read back from storage.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

impl ParseStatusError {
    pub(crate) fn job(value: &str) -> Self {
        Self {
            kind: "job status",
            value: value.to_string(),
        }
    }

    pub(crate) fn task(value: &str) -> Self {
        Self {
            kind: "task status",
            value: value.to_string(),
        }
    }

    pub(crate) fn source(value: &str) -> Self {
        Self {
            kind: "task source",
            value: value.to_string(),
        }
    }
}

/// Classification of a failed crawl attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network I/O, DNS or TLS problem. Retryable.
    Transport,
    /// Upstream throttling (429/503/408 or a governor-detected signal).
    /// Retryable, and feeds the per-domain governor.
    RateLimited,
    /// Upstream 4xx other than 408/429. Not retryable.
    Permanent,
    /// A failure on our side of the exchange (worker panic, internal bug).
    /// Retryable.
    Internal,
}

impl FailureKind {
    /// Map an HTTP status code to a failure class; `None` for success codes.
    pub fn from_status(status: u16) -> Option<FailureKind> {
        match status {
            408 | 429 | 503 => Some(FailureKind::RateLimited),
            400..=499 => Some(FailureKind::Permanent),
            500..=599 => Some(FailureKind::Transport),
            _ => None,
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }

    /// Whether this failure should escalate the domain's adaptive delay.
    pub fn is_throttle_signal(self) -> bool {
        matches!(self, FailureKind::RateLimited)
    }
}

/// A failed crawl attempt with its classification.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct CrawlFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CrawlFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::RateLimited,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Internal,
            message: message.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

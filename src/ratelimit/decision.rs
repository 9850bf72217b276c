//! Admission decision against the aggregate usage of the fleet.

use chrono::{DateTime, Utc};

use super::window::Window;

/// Outcome of checking a request against its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed downstream
    Admitted,
    /// The quota is spent; retry once the window has closed
    Rejected {
        /// End of the current window
        retry_after: DateTime<Utc>,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }
}

/// Decide whether a request fits in what is left of the window.
///
/// `pending_cost` is the usage the request is known to spend before it runs.
/// The request that brings usage exactly to `limit` is admitted; the one that
/// would take it past `limit` is rejected.
pub fn decide(aggregate: u64, pending_cost: u64, limit: u64, window: &Window) -> Decision {
    if aggregate.saturating_add(pending_cost) > limit {
        Decision::Rejected {
            retry_after: window.end(),
        }
    } else {
        Decision::Admitted
    }
}

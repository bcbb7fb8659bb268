//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Whole seconds elapsed since `since`, clamped at zero
pub fn elapsed_secs(since: DateTime<Utc>) -> u64 {
    Utc::now().signed_duration_since(since).num_seconds().max(0) as u64
}

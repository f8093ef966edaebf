//! Read models returned by storage backends.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current time in Unix seconds, the unit of every `expired_at`.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// One row of the derived membership index.
///
/// Aggregates every template membership a subject holds for one group,
/// scoped to a system the group is authorized in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectSystemGroup {
    pub system_id: String,
    pub subject_type: String,
    pub subject_id: String,
    pub group_id: i64,
    /// Latest expiry across the contributing template memberships.
    pub expired_at: i64,
    /// Number of template memberships behind this row.
    pub template_count: i64,
}

impl SubjectSystemGroup {
    /// Returns `true` if the membership is still active at `now` (Unix seconds).
    #[must_use]
    pub fn is_active_at(&self, now: i64) -> bool {
        self.expired_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_active_at() {
        let row = SubjectSystemGroup {
            system_id: "bk_cmdb".into(),
            subject_type: "user".into(),
            subject_id: "alice".into(),
            group_id: 1,
            expired_at: 100,
            template_count: 1,
        };
        assert!(row.is_active_at(99));
        assert!(!row.is_active_at(100));
    }

    #[test]
    fn test_unix_now_is_past_2020() {
        assert!(unix_now() > 1_577_836_800);
    }
}

//! Subject ↔ template ↔ group membership facts.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A single membership granted to a subject through a subject template.
///
/// `(subject_type, subject_id, template_id, group_id)` is the natural key;
/// only `expired_at` (Unix seconds) may change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectTemplateGroup {
    #[serde(rename = "type")]
    pub subject_type: String,
    #[serde(rename = "id")]
    pub subject_id: String,
    pub template_id: i64,
    pub group_id: i64,
    pub expired_at: i64,
}

/// Natural key of a [`SubjectTemplateGroup`] row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MembershipKey {
    pub subject_type: String,
    pub subject_id: String,
    pub template_id: i64,
    pub group_id: i64,
}

/// A subject's membership of a group, independent of the template that grants it.
///
/// This is the grain of the derived membership index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectGroupKey {
    #[serde(rename = "type")]
    pub subject_type: String,
    #[serde(rename = "id")]
    pub subject_id: String,
    pub group_id: i64,
}

impl SubjectTemplateGroup {
    pub fn new(
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
        template_id: i64,
        group_id: i64,
        expired_at: i64,
    ) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            template_id,
            group_id,
            expired_at,
        }
    }

    pub fn key(&self) -> MembershipKey {
        MembershipKey {
            subject_type: self.subject_type.clone(),
            subject_id: self.subject_id.clone(),
            template_id: self.template_id,
            group_id: self.group_id,
        }
    }

    pub fn subject_group(&self) -> SubjectGroupKey {
        SubjectGroupKey {
            subject_type: self.subject_type.clone(),
            subject_id: self.subject_id.clone(),
            group_id: self.group_id,
        }
    }

    /// Validates a single item; `index` is its position in the batch, used in messages.
    pub fn validate(&self, index: usize) -> Result<()> {
        if self.subject_type.trim().is_empty() {
            return Err(CoreError::invalid_input(
                format!("[{index}].type"),
                "must not be empty",
            ));
        }
        if self.subject_id.trim().is_empty() {
            return Err(CoreError::invalid_input(
                format!("[{index}].id"),
                "must not be empty",
            ));
        }
        if self.template_id <= 0 {
            return Err(CoreError::invalid_input(
                format!("[{index}].template_id"),
                "must be greater than 0",
            ));
        }
        if self.group_id <= 0 {
            return Err(CoreError::invalid_input(
                format!("[{index}].group_id"),
                "must be greater than 0",
            ));
        }
        if self.expired_at < 0 {
            return Err(CoreError::invalid_input(
                format!("[{index}].expired_at"),
                "must not be negative",
            ));
        }
        Ok(())
    }

    /// Validates a whole batch: it must be non-empty and every item valid.
    pub fn validate_batch(records: &[SubjectTemplateGroup]) -> Result<()> {
        if records.is_empty() {
            return Err(CoreError::EmptyBatch);
        }
        records
            .iter()
            .enumerate()
            .try_for_each(|(index, record)| record.validate(index))
    }
}

/// Sorts a batch into the lock-acquisition order shared by every writer:
/// group first, then subject, then template.
pub fn sort_for_locking(records: &mut [SubjectTemplateGroup]) {
    records.sort_by(|a, b| {
        (a.group_id, &a.subject_type, &a.subject_id, a.template_id).cmp(&(
            b.group_id,
            &b.subject_type,
            &b.subject_id,
            b.template_id,
        ))
    });
}

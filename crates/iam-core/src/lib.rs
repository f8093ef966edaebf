//! Core types shared by the IAM backend crates.
//!
//! - [`SubjectTemplateGroup`]: one subject↔template↔group membership fact
//! - [`TenantId`]: the isolation boundary carried through every operation
//! - [`CoreError`]: input validation failures

pub mod error;
pub mod subject;
pub mod tenant;

pub use error::{CoreError, Result};
pub use subject::{MembershipKey, SubjectGroupKey, SubjectTemplateGroup, sort_for_locking};
pub use tenant::TenantId;

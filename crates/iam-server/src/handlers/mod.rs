pub mod health;
pub mod subject_template_group;

pub use health::{healthz, readyz};
pub use subject_template_group::{batch_create, batch_delete, batch_update_expired_at};

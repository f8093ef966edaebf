//! Batch endpoints for subject-template-group memberships.

use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    response::Response,
};
use iam_core::{SubjectTemplateGroup, TenantId};

use crate::response::{self, ApiError};
use crate::server::AppState;

type Batch = Result<Json<Vec<SubjectTemplateGroup>>, JsonRejection>;

fn validated(body: Batch) -> Result<Vec<SubjectTemplateGroup>, ApiError> {
    let Json(records) = body?;
    SubjectTemplateGroup::validate_batch(&records)?;
    Ok(records)
}

/// POST /api/v1/web/subject-template-groups
pub async fn batch_create(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantId>,
    body: Batch,
) -> Result<Response, ApiError> {
    let records = validated(body)?;
    state
        .controller
        .bulk_create(&tenant, records)
        .await
        .map_err(|e| ApiError::from_membership("BatchCreateSubjectTemplateGroup", e))?;
    Ok(response::ok())
}

/// DELETE /api/v1/web/subject-template-groups
pub async fn batch_delete(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantId>,
    body: Batch,
) -> Result<Response, ApiError> {
    let records = validated(body)?;
    state
        .controller
        .bulk_delete(&tenant, records)
        .await
        .map_err(|e| ApiError::from_membership("BatchDeleteSubjectTemplateGroup", e))?;
    Ok(response::ok())
}

/// PUT /api/v1/web/subject-template-groups/expired-at
pub async fn batch_update_expired_at(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantId>,
    body: Batch,
) -> Result<Response, ApiError> {
    let records = validated(body)?;
    state
        .controller
        .update_expired_at(&tenant, records)
        .await
        .map_err(|e| {
            ApiError::from_membership("BatchUpdateSubjectTemplateGroupExpiredAt", e)
        })?;
    Ok(response::ok())
}

//! Student registration, enrollment uploads and CRUD.

use crate::error::ApiError;
use crate::state::SharedState;
use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;

#[derive(Deserialize)]
pub struct RegisterStudent {
    pub student_no: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub group_name: Option<String>,
}

pub async fn register(
    State(state): State<SharedState>,
    Json(body): Json<RegisterStudent>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.student_no.trim().is_empty() {
        return Err(ApiError::BadRequest("student_no must not be empty".into()));
    }
    let student = state
        .store
        .create_student(crate::store::NewStudent {
            student_no: body.student_no,
            first_name: body.first_name,
            last_name: body.last_name,
            group_name: body.group_name,
        })
        .await?;
    tracing::info!(student_no = %student.student_no, id = student.id, "student registered");
    Ok(Json(serde_json::json!(student)))
}

pub async fn upload_images(
    State(state): State<SharedState>,
    Path(student_no): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let student = state
        .store
        .student_by_no(student_no.clone())
        .await?
        .ok_or(ApiError::NotFound("student"))?;

    let mut images: Vec<Bytes> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("bad multipart body: {e}")))?
    {
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("bad multipart body: {e}")))?;
        if !data.is_empty() {
            images.push(data);
        }
    }
    if images.is_empty() {
        return Err(ApiError::BadRequest("no images in request".into()));
    }

    let summary = state.coordinator.enroll(student.id, images).await?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "student_no": student_no,
        "successful": summary.successful,
        "skipped": summary.skipped,
        "reference_ids": summary.reference_ids,
    })))
}

#[derive(Deserialize)]
pub struct Page {
    #[serde(default)]
    pub skip: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list(
    State(state): State<SharedState>,
    Query(page): Query<Page>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let skip = page.skip.unwrap_or(0).max(0);
    let limit = page.limit.unwrap_or(100).clamp(1, 500);
    let students = state.store.list_students(skip, limit).await?;
    Ok(Json(serde_json::json!(students)))
}

pub async fn get(
    State(state): State<SharedState>,
    Path(student_no): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let student = state
        .store
        .student_by_no(student_no)
        .await?
        .ok_or(ApiError::NotFound("student"))?;
    let image_count = state.store.count_reference_images(student.id).await?;
    let mut value = serde_json::json!(student);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("image_count".into(), serde_json::json!(image_count));
    }
    Ok(Json(value))
}

/// Delete a student: store rows cascade, index slots are removed, presence
/// entries are cleared.
pub async fn delete(
    State(state): State<SharedState>,
    Path(student_no): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some((person_id, removed_slots)) = state.coordinator.delete_person(&student_no).await?
    else {
        return Err(ApiError::NotFound("student"));
    };
    state.presence.remove_person(person_id);

    Ok(Json(serde_json::json!({
        "status": "deleted",
        "student_no": student_no,
        "removed_embeddings": removed_slots,
    })))
}

//! Attendance check-in and queries.

use crate::error::ApiError;
use crate::gate::CheckOutcome;
use crate::state::SharedState;
use axum::extract::{Path, Query, State};
use axum::Json;
use base64::Engine as _;
use chrono::{Datelike, NaiveDate, Utc};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct CheckInRequest {
    /// Base64 JPEG, with or without a `data:image/...;base64,` prefix.
    pub image: String,
}

/// Single-shot web check-in: detect, match, gate.
///
/// Outcome vocabulary is fixed: `success`, `already_attended`, `no_match`,
/// `no_face`, `error`.
pub async fn check_in(
    State(state): State<SharedState>,
    Json(body): Json<CheckInRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let encoded = body
        .image
        .rsplit_once(',')
        .map(|(_, data)| data.to_string())
        .unwrap_or(body.image);
    let jpeg = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| ApiError::BadRequest("invalid base64 image".into()))?;

    // Decode + detect off the runtime.
    let provider = state.provider.clone();
    let jpeg_for_detection = jpeg.clone();
    let work = tokio::task::spawn_blocking(move || {
        let decoded = image::load_from_memory(&jpeg_for_detection)
            .map_err(|e| ApiError::BadRequest(format!("invalid image: {e}")))?
            .to_rgb8();
        let (width, height) = (decoded.width(), decoded.height());
        provider
            .detect(decoded.as_raw(), width, height)
            .map_err(|e| ApiError::Internal(e.into()))
    });
    let faces = match tokio::time::timeout(state.config.image_timeout, work).await {
        Ok(Ok(result)) => result?,
        Ok(Err(join_err)) => return Err(ApiError::Internal(join_err.into())),
        Err(_) => {
            return Ok(Json(serde_json::json!({
                "status": "error",
                "message": "image processing timed out",
            })))
        }
    };

    // On multiple faces, the largest one checks in.
    let Some(face) = faces
        .iter()
        .max_by(|a, b| {
            a.bbox
                .area()
                .partial_cmp(&b.bbox.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    else {
        return Ok(Json(serde_json::json!({
            "status": "no_face",
            "message": "no face detected, try again",
        })));
    };

    let hits = state
        .index
        .read()
        .search(&face.embedding, 1, state.config.confidence_threshold)
        .map_err(|e| ApiError::Internal(e.into()))?;
    let Some(hit) = hits.first().cloned() else {
        return Ok(Json(serde_json::json!({
            "status": "no_match",
            "message": "face not recognized",
        })));
    };

    let Some(student) = state.store.student_by_id(hit.person_id).await? else {
        // Index slot without a row: should not happen, treat as no match.
        tracing::error!(person_id = hit.person_id, "index hit without student row");
        return Ok(Json(serde_json::json!({
            "status": "no_match",
            "message": "face not recognized",
        })));
    };

    let outcome = state
        .gate
        .record_with_snapshot(
            student.id,
            &student.student_no,
            hit.score,
            Utc::now(),
            &jpeg,
            &state.config.snapshots_dir(),
        )
        .await?;

    let response = match outcome {
        CheckOutcome::Created {
            attendance_id,
            check_in_time,
        } => serde_json::json!({
            "status": "success",
            "person": student,
            "confidence": hit.score,
            "check_in_time": check_in_time.format("%H:%M:%S").to_string(),
            "attendance_id": attendance_id,
        }),
        CheckOutcome::Already { check_in_time } => serde_json::json!({
            "status": "already_attended",
            "person": student,
            "confidence": hit.score,
            "check_in_time": check_in_time.format("%H:%M:%S").to_string(),
        }),
        CheckOutcome::Suppressed => serde_json::json!({
            "status": "no_match",
            "message": "confidence below attendance floor",
            "confidence": hit.score,
        }),
    };
    Ok(Json(response))
}

pub async fn today(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let (day, _) = state.gate.local_day(Utc::now());
    let records = state.store.attendance_for_date(day).await?;
    Ok(Json(serde_json::json!({
        "date": day.to_string(),
        "total_attendance": records.len(),
        "records": records,
    })))
}

#[derive(Deserialize)]
pub struct HistoryRange {
    #[serde(default)]
    pub date_from: Option<String>,
    #[serde(default)]
    pub date_to: Option<String>,
}

fn parse_date(value: &Option<String>, field: &str) -> Result<Option<NaiveDate>, ApiError> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("invalid {field}: use YYYY-MM-DD"))),
    }
}

pub async fn student_history(
    State(state): State<SharedState>,
    Path(student_no): Path<String>,
    Query(range): Query<HistoryRange>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let student = state
        .store
        .student_by_no(student_no)
        .await?
        .ok_or(ApiError::NotFound("student"))?;

    let from = parse_date(&range.date_from, "date_from")?;
    let to = parse_date(&range.date_to, "date_to")?;
    let records = state.store.attendance_history(student.id, from, to).await?;

    Ok(Json(serde_json::json!({
        "student": student,
        "total_records": records.len(),
        "records": records,
    })))
}

pub async fn statistics(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (today, _) = state.gate.local_day(Utc::now());
    let week_start = today - chrono::Duration::days(today.weekday().num_days_from_monday() as i64);
    let month_start = today.with_day(1).unwrap_or(today);

    let stats = state
        .store
        .attendance_stats(today, week_start, month_start)
        .await?;
    let mut value = serde_json::json!(stats);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("date".into(), serde_json::json!(today.to_string()));
    }
    Ok(Json(value))
}

//! Presence read API.

use crate::error::ApiError;
use crate::presence::{all_presence_payload, occupants_json, room_presence_payload};
use crate::state::SharedState;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;

pub async fn room_presence(
    State(state): State<SharedState>,
    Path(room_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = state
        .store
        .room_by_id(room_id)
        .await?
        .ok_or(ApiError::NotFound("room"))?;
    let payload =
        room_presence_payload(&state.store, &state.presence, room.id, &room.name, Utc::now())
            .await?;
    Ok(Json(payload))
}

pub async fn all_presence(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (rooms, total_people) =
        all_presence_payload(&state.store, &state.presence, Utc::now()).await?;
    Ok(Json(serde_json::json!({
        "rooms": rooms,
        "total_people": total_people,
    })))
}

pub async fn student_location(
    State(state): State<SharedState>,
    Path(student_no): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let student = state
        .store
        .student_by_no(student_no)
        .await?
        .ok_or(ApiError::NotFound("student"))?;

    let Some(entry) = state.presence.locate(student.id, Utc::now()) else {
        return Ok(Json(serde_json::json!({
            "student_no": student.student_no,
            "present": false,
        })));
    };

    let room_name = state
        .store
        .room_by_id(entry.room_id)
        .await?
        .map(|r| r.name)
        .unwrap_or_default();
    let occupant = occupants_json(&state.store, std::slice::from_ref(&entry))
        .await?
        .pop();

    Ok(Json(serde_json::json!({
        "student_no": student.student_no,
        "present": true,
        "room_id": entry.room_id,
        "room_name": room_name,
        "entry": occupant,
    })))
}

pub async fn stats(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let now = Utc::now();
    let (rooms, total_people) = state.presence.snapshot_all(now);
    let occupied_rooms = rooms.values().filter(|v| !v.is_empty()).count();
    let total_rooms = state.store.list_rooms(false).await?.len();

    Ok(Json(serde_json::json!({
        "total_people_tracked": total_people,
        "total_rooms": total_rooms,
        "occupied_rooms": occupied_rooms,
        "presence_ttl_seconds": state.config.presence_ttl.as_secs(),
    })))
}

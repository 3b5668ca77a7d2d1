//! Rooms and cameras: CRUD plus worker start/stop control.

use crate::error::ApiError;
use crate::state::SharedState;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

#[derive(Deserialize)]
pub struct CreateRoom {
    pub name: String,
}

pub async fn create_room(
    State(state): State<SharedState>,
    Json(body): Json<CreateRoom>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("room name must not be empty".into()));
    }
    let room = state.store.create_room(body.name).await?;
    Ok(Json(serde_json::json!(room)))
}

#[derive(Deserialize)]
pub struct ListRooms {
    #[serde(default)]
    pub include_inactive: bool,
}

pub async fn list_rooms(
    State(state): State<SharedState>,
    Query(query): Query<ListRooms>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rooms = state.store.list_rooms(query.include_inactive).await?;
    Ok(Json(serde_json::json!(rooms)))
}

/// Room detail: cameras with their live worker status.
pub async fn get_room(
    State(state): State<SharedState>,
    Path(room_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = state
        .store
        .room_by_id(room_id)
        .await?
        .ok_or(ApiError::NotFound("room"))?;
    let cameras = state.store.cameras_in_room(room_id).await?;

    let mut camera_views = Vec::with_capacity(cameras.len());
    for camera in cameras {
        let status = state.workers.status(camera.id).await;
        let mut view = serde_json::json!(camera);
        if let Some(obj) = view.as_object_mut() {
            match status {
                Some(status) => {
                    obj.insert("runtime".into(), serde_json::json!(status));
                }
                None => {
                    obj.insert(
                        "runtime".into(),
                        serde_json::json!(crate::events::WorkerStatus::offline()),
                    );
                }
            }
        }
        camera_views.push(view);
    }

    let mut value = serde_json::json!(room);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("cameras".into(), serde_json::Value::Array(camera_views));
    }
    Ok(Json(value))
}

#[derive(Deserialize)]
pub struct UpdateRoom {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

pub async fn update_room(
    State(state): State<SharedState>,
    Path(room_id): Path<i64>,
    Json(body): Json<UpdateRoom>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room = state
        .store
        .update_room(room_id, body.name, body.is_active)
        .await?
        .ok_or(ApiError::NotFound("room"))?;
    Ok(Json(serde_json::json!(room)))
}

pub async fn delete_room(
    State(state): State<SharedState>,
    Path(room_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Workers first, so nothing streams from cameras about to disappear.
    let stopped = state.workers.stop_room(room_id).await;
    if !state.store.delete_room(room_id).await? {
        return Err(ApiError::NotFound("room"));
    }
    Ok(Json(serde_json::json!({
        "status": "deleted",
        "room_id": room_id,
        "stopped_cameras": stopped,
    })))
}

#[derive(Deserialize)]
pub struct AddCamera {
    pub name: String,
    pub stream_url: String,
}

pub async fn add_camera(
    State(state): State<SharedState>,
    Path(room_id): Path<i64>,
    Json(body): Json<AddCamera>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .room_by_id(room_id)
        .await?
        .ok_or(ApiError::NotFound("room"))?;

    let existing = state.store.count_cameras(room_id).await?;
    if existing as usize >= state.config.max_cameras_per_room {
        return Err(ApiError::Conflict(format!(
            "room already has the maximum of {} cameras",
            state.config.max_cameras_per_room
        )));
    }

    let camera = state.store.add_camera(room_id, body.name, body.stream_url).await?;
    Ok(Json(serde_json::json!(camera)))
}

pub async fn list_cameras(
    State(state): State<SharedState>,
    Path(room_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .room_by_id(room_id)
        .await?
        .ok_or(ApiError::NotFound("room"))?;
    let cameras = state.store.cameras_in_room(room_id).await?;
    Ok(Json(serde_json::json!(cameras)))
}

pub async fn delete_camera(
    State(state): State<SharedState>,
    Path((room_id, camera_id)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let camera = require_camera(&state, room_id, camera_id).await?;
    state.workers.stop(camera.id).await;
    state.store.delete_camera(camera.id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted", "camera_id": camera_id })))
}

async fn require_camera(
    state: &SharedState,
    room_id: i64,
    camera_id: i64,
) -> Result<crate::store::Camera, ApiError> {
    let camera = state
        .store
        .camera_by_id(camera_id)
        .await?
        .filter(|c| c.room_id == room_id)
        .ok_or(ApiError::NotFound("camera"))?;
    Ok(camera)
}

pub async fn start_camera(
    State(state): State<SharedState>,
    Path((room_id, camera_id)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let camera = require_camera(&state, room_id, camera_id).await?;
    if !camera.is_active {
        return Err(ApiError::Conflict("camera is disabled".into()));
    }
    let started = state.workers.start(camera).await?;
    Ok(Json(serde_json::json!({
        "status": if started { "started" } else { "already_running" },
        "camera_id": camera_id,
    })))
}

pub async fn stop_camera(
    State(state): State<SharedState>,
    Path((room_id, camera_id)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_camera(&state, room_id, camera_id).await?;
    let stopped = state.workers.stop(camera_id).await;
    Ok(Json(serde_json::json!({
        "status": if stopped { "stopped" } else { "not_running" },
        "camera_id": camera_id,
    })))
}

pub async fn start_all(
    State(state): State<SharedState>,
    Path(room_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .room_by_id(room_id)
        .await?
        .ok_or(ApiError::NotFound("room"))?;

    let cameras = state.store.cameras_in_room(room_id).await?;
    let mut started = 0;
    let mut failed = 0;
    for camera in cameras.into_iter().filter(|c| c.is_active) {
        match state.workers.start(camera).await {
            Ok(true) => started += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(room_id, error = %err, "start-all hit the stream limit");
                failed += 1;
            }
        }
    }
    Ok(Json(serde_json::json!({
        "room_id": room_id,
        "started": started,
        "failed": failed,
    })))
}

pub async fn stop_all(
    State(state): State<SharedState>,
    Path(room_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .store
        .room_by_id(room_id)
        .await?
        .ok_or(ApiError::NotFound("room"))?;
    let stopped = state.workers.stop_room(room_id).await;
    Ok(Json(serde_json::json!({ "room_id": room_id, "stopped": stopped })))
}

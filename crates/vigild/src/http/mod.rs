//! HTTP and WebSocket surface.

use crate::state::SharedState;
use axum::routing::{delete, get, post};
use axum::{Json, Router};

mod attendance;
mod presence;
mod rooms;
mod students;
mod ws;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        // Students
        .route("/students/register", post(students::register))
        .route("/students", get(students::list))
        .route(
            "/students/:student_no/upload-images",
            post(students::upload_images),
        )
        .route(
            "/students/:student_no",
            get(students::get).delete(students::delete),
        )
        // Attendance
        .route("/attendance/check-in", post(attendance::check_in))
        .route("/attendance/today", get(attendance::today))
        .route("/attendance/student/:student_no", get(attendance::student_history))
        .route("/attendance/statistics", get(attendance::statistics))
        // Presence reads (static segments before `:room_id` routes)
        .route("/rooms/presence/all", get(presence::all_presence))
        .route("/rooms/presence/student/:student_no", get(presence::student_location))
        .route("/rooms/presence/stats", get(presence::stats))
        .route("/rooms/:room_id/presence", get(presence::room_presence))
        // Rooms and cameras
        .route("/rooms", post(rooms::create_room).get(rooms::list_rooms))
        .route(
            "/rooms/:room_id",
            get(rooms::get_room)
                .patch(rooms::update_room)
                .delete(rooms::delete_room),
        )
        .route(
            "/rooms/:room_id/cameras",
            post(rooms::add_camera).get(rooms::list_cameras),
        )
        .route(
            "/rooms/:room_id/cameras/:camera_id",
            delete(rooms::delete_camera),
        )
        .route(
            "/rooms/:room_id/cameras/:camera_id/start",
            post(rooms::start_camera),
        )
        .route(
            "/rooms/:room_id/cameras/:camera_id/stop",
            post(rooms::stop_camera),
        )
        .route("/rooms/:room_id/start-all", post(rooms::start_all))
        .route("/rooms/:room_id/stop-all", post(rooms::stop_all))
        // WebSockets
        .route("/ws/cameras/:camera_id/stream", get(ws::camera_stream))
        .route("/ws/rooms/all/presence", get(ws::all_rooms_presence))
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "vigil",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

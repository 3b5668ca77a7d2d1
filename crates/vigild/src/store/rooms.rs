//! Rooms and their cameras.

use super::{now_rfc3339, Store, StoreError};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Room {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Camera {
    pub id: i64,
    pub room_id: i64,
    pub name: String,
    pub stream_url: String,
    pub is_active: bool,
    pub created_at: String,
}

fn room_from_row(row: &Row<'_>) -> rusqlite::Result<Room> {
    Ok(Room {
        id: row.get(0)?,
        name: row.get(1)?,
        is_active: row.get::<_, i64>(2)? != 0,
        created_at: row.get(3)?,
    })
}

fn camera_from_row(row: &Row<'_>) -> rusqlite::Result<Camera> {
    Ok(Camera {
        id: row.get(0)?,
        room_id: row.get(1)?,
        name: row.get(2)?,
        stream_url: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

const ROOM_COLS: &str = "id, name, is_active, created_at";
const CAMERA_COLS: &str = "id, room_id, name, stream_url, is_active, created_at";

impl Store {
    pub async fn create_room(&self, name: String) -> Result<Room, StoreError> {
        self.call(move |conn| {
            let created_at = now_rfc3339();
            match conn.execute(
                "INSERT INTO rooms (name, is_active, created_at) VALUES (?1, 1, ?2)",
                params![name, created_at],
            ) {
                Ok(_) => {}
                Err(e) if StoreError::is_constraint_violation(&e) => {
                    return Err(StoreError::Duplicate("room"));
                }
                Err(e) => return Err(e.into()),
            }
            Ok(Room {
                id: conn.last_insert_rowid(),
                name,
                is_active: true,
                created_at,
            })
        })
        .await
    }

    pub async fn room_by_id(&self, id: i64) -> Result<Option<Room>, StoreError> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {ROOM_COLS} FROM rooms WHERE id = ?1"),
                params![id],
                room_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn list_rooms(&self, include_inactive: bool) -> Result<Vec<Room>, StoreError> {
        self.call(move |conn| {
            let sql = if include_inactive {
                format!("SELECT {ROOM_COLS} FROM rooms ORDER BY name")
            } else {
                format!("SELECT {ROOM_COLS} FROM rooms WHERE is_active = 1 ORDER BY name")
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], room_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn update_room(
        &self,
        id: i64,
        name: Option<String>,
        is_active: Option<bool>,
    ) -> Result<Option<Room>, StoreError> {
        self.call(move |conn| {
            if let Some(name) = &name {
                conn.execute("UPDATE rooms SET name = ?1 WHERE id = ?2", params![name, id])?;
            }
            if let Some(active) = is_active {
                conn.execute(
                    "UPDATE rooms SET is_active = ?1 WHERE id = ?2",
                    params![active as i64, id],
                )?;
            }
            conn.query_row(
                &format!("SELECT {ROOM_COLS} FROM rooms WHERE id = ?1"),
                params![id],
                room_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    /// Delete a room; its cameras cascade.
    pub async fn delete_room(&self, id: i64) -> Result<bool, StoreError> {
        self.call(move |conn| {
            let n = conn.execute("DELETE FROM rooms WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn add_camera(
        &self,
        room_id: i64,
        name: String,
        stream_url: String,
    ) -> Result<Camera, StoreError> {
        self.call(move |conn| {
            let created_at = now_rfc3339();
            match conn.execute(
                "INSERT INTO cameras (room_id, name, stream_url, is_active, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![room_id, name, stream_url, created_at],
            ) {
                Ok(_) => {}
                Err(e) if StoreError::is_constraint_violation(&e) => {
                    // FK failure: the room is gone.
                    return Err(StoreError::NotFound("room"));
                }
                Err(e) => return Err(e.into()),
            }
            Ok(Camera {
                id: conn.last_insert_rowid(),
                room_id,
                name,
                stream_url,
                is_active: true,
                created_at,
            })
        })
        .await
    }

    pub async fn camera_by_id(&self, id: i64) -> Result<Option<Camera>, StoreError> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {CAMERA_COLS} FROM cameras WHERE id = ?1"),
                params![id],
                camera_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn cameras_in_room(&self, room_id: i64) -> Result<Vec<Camera>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CAMERA_COLS} FROM cameras WHERE room_id = ?1 ORDER BY name"
            ))?;
            let rows = stmt.query_map(params![room_id], camera_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn count_cameras(&self, room_id: i64) -> Result<i64, StoreError> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM cameras WHERE room_id = ?1",
                params![room_id],
                |r| r.get(0),
            )
            .map_err(Into::into)
        })
        .await
    }

    pub async fn delete_camera(&self, id: i64) -> Result<bool, StoreError> {
        self.call(move |conn| {
            let n = conn.execute("DELETE FROM cameras WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use super::*;

    #[tokio::test]
    async fn test_room_crud() {
        let (store, _dir) = temp_store();
        let room = store.create_room("Lab 1".into()).await.unwrap();
        assert!(room.is_active);

        let updated = store
            .update_room(room.id, Some("Lab 1a".into()), Some(false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Lab 1a");
        assert!(!updated.is_active);

        assert!(store.delete_room(room.id).await.unwrap());
        assert!(store.room_by_id(room.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_room_name_rejected() {
        let (store, _dir) = temp_store();
        store.create_room("Lab 1".into()).await.unwrap();
        let err = store.create_room("Lab 1".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate("room")));
    }

    #[tokio::test]
    async fn test_deleting_room_cascades_cameras() {
        let (store, _dir) = temp_store();
        let room = store.create_room("Lab 1".into()).await.unwrap();
        let cam = store
            .add_camera(room.id, "door".into(), "rtsp://cam/1".into())
            .await
            .unwrap();

        store.delete_room(room.id).await.unwrap();
        assert!(store.camera_by_id(cam.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_camera_to_missing_room() {
        let (store, _dir) = temp_store();
        let err = store
            .add_camera(999, "door".into(), "rtsp://cam/1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound("room")));
    }
}

//! Student rows and their enrolled reference images.

use super::{now_rfc3339, Store, StoreError};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Student {
    pub id: i64,
    pub student_no: String,
    pub first_name: String,
    pub last_name: String,
    pub group_name: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentWithImages {
    #[serde(flatten)]
    pub student: Student,
    pub image_count: i64,
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub student_no: String,
    pub first_name: String,
    pub last_name: String,
    pub group_name: Option<String>,
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        student_no: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        group_name: row.get(4)?,
        created_at: row.get(5)?,
    })
}

const STUDENT_COLS: &str = "id, student_no, first_name, last_name, group_name, created_at";

impl Store {
    pub async fn create_student(&self, new: NewStudent) -> Result<Student, StoreError> {
        self.call(move |conn| {
            let created_at = now_rfc3339();
            let result = conn.execute(
                "INSERT INTO students (student_no, first_name, last_name, group_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![new.student_no, new.first_name, new.last_name, new.group_name, created_at],
            );
            match result {
                Ok(_) => {}
                Err(e) if StoreError::is_constraint_violation(&e) => {
                    return Err(StoreError::Duplicate("student"));
                }
                Err(e) => return Err(e.into()),
            }
            let id = conn.last_insert_rowid();
            Ok(Student {
                id,
                student_no: new.student_no,
                first_name: new.first_name,
                last_name: new.last_name,
                group_name: new.group_name,
                created_at,
            })
        })
        .await
    }

    pub async fn student_by_no(&self, student_no: String) -> Result<Option<Student>, StoreError> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {STUDENT_COLS} FROM students WHERE student_no = ?1"),
                params![student_no],
                student_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn student_by_id(&self, id: i64) -> Result<Option<Student>, StoreError> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {STUDENT_COLS} FROM students WHERE id = ?1"),
                params![id],
                student_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    /// Fetch a batch of students by internal id; missing ids are skipped.
    pub async fn students_by_ids(&self, ids: Vec<i64>) -> Result<Vec<Student>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.call(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(",");
            let sql = format!("SELECT {STUDENT_COLS} FROM students WHERE id IN ({placeholders})");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), student_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn list_students(
        &self,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<StudentWithImages>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.student_no, s.first_name, s.last_name, s.group_name, s.created_at,
                        COUNT(i.id)
                 FROM students s
                 LEFT JOIN student_images i ON i.student_id = s.id
                 GROUP BY s.id
                 ORDER BY s.student_no
                 LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![limit, skip], |row| {
                Ok(StudentWithImages {
                    student: student_from_row(row)?,
                    image_count: row.get(6)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Delete a student; images and attendance rows cascade.
    ///
    /// Returns the internal id so the caller can clear the index and
    /// presence entries.
    pub async fn delete_student_by_no(
        &self,
        student_no: String,
    ) -> Result<Option<i64>, StoreError> {
        self.call(move |conn| {
            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM students WHERE student_no = ?1",
                    params![student_no],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = id {
                conn.execute("DELETE FROM students WHERE id = ?1", params![id])?;
            }
            Ok(id)
        })
        .await
    }

    /// Insert one enrolled reference image row, returning its id.
    pub async fn insert_reference_image(
        &self,
        student_id: i64,
        image_path: String,
        embedding_blob: Vec<u8>,
    ) -> Result<i64, StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO student_images (student_id, image_path, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![student_id, image_path, embedding_blob, now_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Remove one reference row (the enrollment rollback path).
    pub async fn delete_reference_image(&self, id: i64) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute("DELETE FROM student_images WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    pub async fn count_reference_images(&self, student_id: i64) -> Result<i64, StoreError> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM student_images WHERE student_id = ?1",
                params![student_id],
                |r| r.get(0),
            )
            .map_err(Into::into)
        })
        .await
    }

    /// Total reference rows, for the startup index/DB consistency check.
    /// (Full embedding reads live in the offline admin tool, which opens
    /// the database directly.)
    pub async fn count_all_reference_images(&self) -> Result<i64, StoreError> {
        self.call(|conn| {
            conn.query_row("SELECT COUNT(*) FROM student_images", [], |r| r.get(0))
                .map_err(Into::into)
        })
        .await
    }
}

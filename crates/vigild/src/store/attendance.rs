//! Attendance rows. Daily uniqueness is the database's job: the
//! `(student_id, attendance_date)` unique constraint stays correct across
//! concurrent writers and restarts, so no in-process lock is involved.

use super::{now_rfc3339, Store, StoreError};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub student_id: i64,
    pub attendance_date: String,
    pub check_in_time: String,
    pub confidence: f64,
    pub snapshot_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceWithStudent {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub student_no: String,
    pub first_name: String,
    pub last_name: String,
    pub group_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceStats {
    pub total_students: i64,
    pub today_attendance: i64,
    pub week_attendance: i64,
    pub month_attendance: i64,
    pub attendance_rate: f64,
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        attendance_date: row.get(2)?,
        check_in_time: row.get(3)?,
        confidence: row.get(4)?,
        snapshot_path: row.get(5)?,
    })
}

const RECORD_COLS: &str =
    "id, student_id, attendance_date, check_in_time, confidence, snapshot_path";

impl Store {
    /// Insert a check-in guarded by the daily unique constraint.
    ///
    /// A constraint violation surfaces as `Duplicate` so the gate can
    /// translate it to an already-attended outcome.
    pub async fn insert_attendance(
        &self,
        student_id: i64,
        day: NaiveDate,
        time: chrono::NaiveTime,
        confidence: f64,
    ) -> Result<i64, StoreError> {
        self.call(move |conn| {
            let result = conn.execute(
                "INSERT INTO attendance
                    (student_id, attendance_date, check_in_time, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    student_id,
                    day.to_string(),
                    time.format("%H:%M:%S").to_string(),
                    confidence,
                    now_rfc3339()
                ],
            );
            match result {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(e) if StoreError::is_constraint_violation(&e) => {
                    Err(StoreError::Duplicate("attendance"))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn attendance_for_day(
        &self,
        student_id: i64,
        day: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {RECORD_COLS} FROM attendance
                     WHERE student_id = ?1 AND attendance_date = ?2"
                ),
                params![student_id, day.to_string()],
                record_from_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn set_attendance_snapshot(
        &self,
        attendance_id: i64,
        snapshot_path: String,
    ) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE attendance SET snapshot_path = ?1 WHERE id = ?2",
                params![snapshot_path, attendance_id],
            )?;
            Ok(())
        })
        .await
    }

    /// All of one day's records joined with student identity, newest first.
    pub async fn attendance_for_date(
        &self,
        day: NaiveDate,
    ) -> Result<Vec<AttendanceWithStudent>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT a.id, a.student_id, a.attendance_date, a.check_in_time, a.confidence,
                        a.snapshot_path, s.student_no, s.first_name, s.last_name, s.group_name
                 FROM attendance a
                 JOIN students s ON s.id = a.student_id
                 WHERE a.attendance_date = ?1
                 ORDER BY a.check_in_time DESC",
            )?;
            let rows = stmt.query_map(params![day.to_string()], |row| {
                Ok(AttendanceWithStudent {
                    record: record_from_row(row)?,
                    student_no: row.get(6)?,
                    first_name: row.get(7)?,
                    last_name: row.get(8)?,
                    group_name: row.get(9)?,
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

    /// One student's history, optionally bounded by inclusive dates.
    pub async fn attendance_history(
        &self,
        student_id: i64,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.call(move |conn| {
            let mut sql = format!(
                "SELECT {RECORD_COLS} FROM attendance WHERE student_id = ?1"
            );
            let mut args: Vec<String> = Vec::new();
            if let Some(from) = date_from {
                args.push(from.to_string());
                sql.push_str(&format!(" AND attendance_date >= ?{}", args.len() + 1));
            }
            if let Some(to) = date_to {
                args.push(to.to_string());
                sql.push_str(&format!(" AND attendance_date <= ?{}", args.len() + 1));
            }
            sql.push_str(" ORDER BY attendance_date DESC");

            let mut stmt = conn.prepare(&sql)?;
            let params_vec: Vec<&dyn rusqlite::ToSql> = std::iter::once(&student_id as &dyn rusqlite::ToSql)
                .chain(args.iter().map(|a| a as &dyn rusqlite::ToSql))
                .collect();
            let rows = stmt.query_map(params_vec.as_slice(), record_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    /// Aggregate counters for the statistics endpoint.
    pub async fn attendance_stats(
        &self,
        today: NaiveDate,
        week_start: NaiveDate,
        month_start: NaiveDate,
    ) -> Result<AttendanceStats, StoreError> {
        self.call(move |conn| {
            let total_students: i64 =
                conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?;
            let today_attendance: i64 = conn.query_row(
                "SELECT COUNT(*) FROM attendance WHERE attendance_date = ?1",
                params![today.to_string()],
                |r| r.get(0),
            )?;
            let week_attendance: i64 = conn.query_row(
                "SELECT COUNT(*) FROM attendance WHERE attendance_date >= ?1",
                params![week_start.to_string()],
                |r| r.get(0),
            )?;
            let month_attendance: i64 = conn.query_row(
                "SELECT COUNT(*) FROM attendance WHERE attendance_date >= ?1",
                params![month_start.to_string()],
                |r| r.get(0),
            )?;

            let attendance_rate = if total_students > 0 {
                (today_attendance as f64 / total_students as f64 * 10_000.0).round() / 100.0
            } else {
                0.0
            };

            Ok(AttendanceStats {
                total_students,
                today_attendance,
                week_attendance,
                month_attendance,
                attendance_rate,
            })
        })
        .await
    }
}

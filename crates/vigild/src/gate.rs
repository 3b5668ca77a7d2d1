//! Once-per-day attendance gate.
//!
//! Correctness rests entirely on the database's `(student, day)` unique
//! constraint: any interleaving of concurrent recordings, including across
//! a crash/restart, yields exactly one stored row per person per day.

use crate::store::{Store, StoreError};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use std::path::{Path, PathBuf};

/// Result of one recording attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// First check-in of the day.
    Created {
        attendance_id: i64,
        check_in_time: NaiveTime,
    },
    /// A row for this `(person, day)` already existed.
    Already { check_in_time: NaiveTime },
    /// Confidence below the attendance floor; nothing recorded.
    Suppressed,
}

#[derive(Clone)]
pub struct AttendanceGate {
    store: Store,
    min_confidence: f32,
    /// Zone defining the calendar-day boundary (see `Config::utc_offset`).
    day_offset: FixedOffset,
}

impl AttendanceGate {
    pub fn new(store: Store, min_confidence: f32, day_offset: FixedOffset) -> Self {
        Self {
            store,
            min_confidence,
            day_offset,
        }
    }

    /// The calendar day and local wall time `now` falls on.
    pub fn local_day(&self, now: DateTime<Utc>) -> (NaiveDate, NaiveTime) {
        let local = now.with_timezone(&self.day_offset);
        (local.date_naive(), local.time())
    }

    /// Attempt to record attendance for a person at `now`.
    pub async fn record(
        &self,
        person_id: i64,
        confidence: f32,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, StoreError> {
        if confidence < self.min_confidence {
            tracing::debug!(person_id, confidence, "attendance suppressed: low confidence");
            return Ok(CheckOutcome::Suppressed);
        }

        let (day, time) = self.local_day(now);
        match self
            .store
            .insert_attendance(person_id, day, time, confidence as f64)
            .await
        {
            Ok(attendance_id) => {
                tracing::info!(person_id, %day, confidence, "attendance recorded");
                Ok(CheckOutcome::Created {
                    attendance_id,
                    check_in_time: time,
                })
            }
            Err(StoreError::Duplicate(_)) => {
                let existing = self.store.attendance_for_day(person_id, day).await?;
                let check_in_time = existing
                    .and_then(|r| r.check_in_time.parse().ok())
                    .unwrap_or(time);
                Ok(CheckOutcome::Already { check_in_time })
            }
            Err(e) => Err(e),
        }
    }

    /// Record attendance and, on `Created`, write the frame snapshot and
    /// attach it to the new row.
    ///
    /// The snapshot is written only after the row exists: a crash can at
    /// worst leave a row without a snapshot, never an unreferenced file.
    pub async fn record_with_snapshot(
        &self,
        person_id: i64,
        student_no: &str,
        confidence: f32,
        now: DateTime<Utc>,
        jpeg: &[u8],
        snapshots_dir: &Path,
    ) -> Result<CheckOutcome, StoreError> {
        let outcome = self.record(person_id, confidence, now).await?;

        if let CheckOutcome::Created { attendance_id, .. } = outcome {
            match write_snapshot(snapshots_dir, student_no, now.with_timezone(&self.day_offset), jpeg)
                .await
            {
                Ok(path) => {
                    self.store
                        .set_attendance_snapshot(attendance_id, path.to_string_lossy().into_owned())
                        .await?;
                }
                Err(err) => {
                    // Attendance itself stands; the snapshot is best-effort.
                    tracing::warn!(person_id, error = %err, "attendance snapshot write failed");
                }
            }
        }
        Ok(outcome)
    }
}

/// Write a snapshot JPEG atomically (temp file + rename), returning the
/// final path.
async fn write_snapshot(
    dir: &Path,
    student_no: &str,
    local: DateTime<FixedOffset>,
    jpeg: &[u8],
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = format!("{student_no}_{}.jpg", local.format("%Y%m%d_%H%M%S"));
    let path = dir.join(name);
    let tmp = path.with_extension("jpg.tmp");
    tokio::fs::write(&tmp, jpeg).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::temp_store;
    use crate::store::NewStudent;
    use chrono::TimeZone;

    async fn student(store: &Store) -> i64 {
        store
            .create_student(NewStudent {
                student_no: "2024001".into(),
                first_name: "A".into(),
                last_name: "B".into(),
                group_name: None,
            })
            .await
            .unwrap()
            .id
    }

    fn utc_gate(store: &Store) -> AttendanceGate {
        AttendanceGate::new(store.clone(), 0.6, chrono::FixedOffset::east_opt(0).unwrap())
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_created_then_already_same_day() {
        let (store, _dir) = temp_store();
        let id = student(&store).await;
        let gate = utc_gate(&store);

        let first = gate.record(id, 0.9, at("2026-03-02T08:30:00Z")).await.unwrap();
        let CheckOutcome::Created { check_in_time, .. } = first else {
            panic!("expected Created, got {first:?}");
        };

        let second = gate.record(id, 0.95, at("2026-03-02T10:00:00Z")).await.unwrap();
        // Second attempt reports the ORIGINAL check-in time.
        assert_eq!(second, CheckOutcome::Already { check_in_time });
    }

    #[tokio::test]
    async fn test_next_day_creates_again() {
        let (store, _dir) = temp_store();
        let id = student(&store).await;
        let gate = utc_gate(&store);

        gate.record(id, 0.9, at("2026-03-02T08:30:00Z")).await.unwrap();
        let next = gate.record(id, 0.9, at("2026-03-03T08:30:00Z")).await.unwrap();
        assert!(matches!(next, CheckOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn test_low_confidence_suppressed() {
        let (store, _dir) = temp_store();
        let id = student(&store).await;
        let gate = utc_gate(&store);

        let outcome = gate.record(id, 0.59, at("2026-03-02T08:30:00Z")).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Suppressed);
        // Nothing was stored: the next attempt still creates.
        let outcome = gate.record(id, 0.9, at("2026-03-02T08:31:00Z")).await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn test_day_boundary_follows_configured_offset() {
        let (store, _dir) = temp_store();
        let id = student(&store).await;
        // +05:00: 2026-03-02T23:30Z is already 04:30 on 03-03 locally.
        let gate = AttendanceGate::new(
            store.clone(),
            0.6,
            chrono::FixedOffset::east_opt(5 * 3600).unwrap(),
        );

        gate.record(id, 0.9, at("2026-03-02T23:30:00Z")).await.unwrap();
        let row = store
            .attendance_for_day(id, "2026-03-03".parse().unwrap())
            .await
            .unwrap();
        assert!(row.is_some());
        assert_eq!(row.unwrap().check_in_time, "04:30:00");
    }

    #[tokio::test]
    async fn test_concurrent_records_create_exactly_once() {
        let (store, _dir) = temp_store();
        let id = student(&store).await;
        let gate = utc_gate(&store);
        let now = Utc.timestamp_opt(1_765_000_000, 0).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.record(id, 0.9, now).await }));
        }

        let mut created = 0;
        let mut already = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                CheckOutcome::Created { .. } => created += 1,
                CheckOutcome::Already { .. } => already += 1,
                CheckOutcome::Suppressed => panic!("unexpected suppression"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(already, 7);
    }

    #[tokio::test]
    async fn test_snapshot_written_after_created_only() {
        let (store, dir) = temp_store();
        let id = student(&store).await;
        let gate = utc_gate(&store);
        let snapshots = dir.path().join("snapshots");

        let outcome = gate
            .record_with_snapshot(id, "2024001", 0.9, at("2026-03-02T08:30:00Z"), b"jpegdata", &snapshots)
            .await
            .unwrap();
        let CheckOutcome::Created { attendance_id, .. } = outcome else {
            panic!("expected Created");
        };

        // File exists and the row points at it.
        let row = store
            .attendance_for_day(id, "2026-03-02".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.id, attendance_id);
        let path = row.snapshot_path.expect("snapshot path recorded");
        assert!(std::path::Path::new(&path).exists());

        // A second attempt is Already and writes nothing new.
        let count_before = std::fs::read_dir(&snapshots).unwrap().count();
        gate.record_with_snapshot(id, "2024001", 0.9, at("2026-03-02T09:30:00Z"), b"x", &snapshots)
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(&snapshots).unwrap().count(), count_before);
    }
}

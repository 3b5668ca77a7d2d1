//! In-memory room presence.
//!
//! `(room, person)` entries with a last-seen timestamp and a TTL. Camera
//! workers `touch` entries on every recognition; a periodic sweep evicts
//! expired ones. Snapshots never show expired entries regardless of sweep
//! timing, because every read re-checks the TTL.
//!
//! Membership changes (first sighting, eviction) are pushed over a channel
//! to the aggregator task below, which is the only publisher of presence
//! topics; per-topic ordering of `presence_update` events follows from
//! that.

use crate::hub::Hub;
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One tracked sighting.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub room_id: i64,
    pub person_id: i64,
    /// Camera that last saw the person; the most recent sighting wins.
    pub camera_id: i64,
    pub last_seen: DateTime<Utc>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    /// No live prior entry for this `(room, person)`.
    Added,
    Refreshed,
}

/// Room whose membership changed (new occupant or eviction).
#[derive(Debug, Clone, Copy)]
pub struct RoomChange {
    pub room_id: i64,
}

pub struct PresenceTracker {
    ttl: Duration,
    entries: Mutex<HashMap<(i64, i64), PresenceEntry>>,
    changes: mpsc::UnboundedSender<RoomChange>,
}

impl PresenceTracker {
    /// Create the tracker plus the change stream consumed by the aggregator.
    pub fn new(ttl: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<RoomChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                ttl,
                entries: Mutex::new(HashMap::new()),
                changes: tx,
            }),
            rx,
        )
    }

    fn is_live(&self, entry: &PresenceEntry, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(entry.last_seen);
        age <= chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero())
    }

    fn notify(&self, room_id: i64) {
        // The aggregator may already be gone during shutdown.
        let _ = self.changes.send(RoomChange { room_id });
    }

    /// Upsert a sighting. O(1).
    pub fn touch(
        &self,
        room_id: i64,
        person_id: i64,
        camera_id: i64,
        now: DateTime<Utc>,
        confidence: f32,
    ) -> TouchOutcome {
        let outcome = {
            let mut entries = self.entries.lock();
            let key = (room_id, person_id);
            let outcome = match entries.get(&key) {
                Some(prior) if self.is_live(prior, now) => TouchOutcome::Refreshed,
                _ => TouchOutcome::Added,
            };
            entries.insert(
                key,
                PresenceEntry {
                    room_id,
                    person_id,
                    camera_id,
                    last_seen: now,
                    confidence,
                },
            );
            outcome
        };

        if outcome == TouchOutcome::Added {
            tracing::debug!(room_id, person_id, camera_id, "presence: person entered room");
            self.notify(room_id);
        }
        outcome
    }

    /// Live entries in one room, most recent first. Does not mutate.
    pub fn snapshot(&self, room_id: i64, now: DateTime<Utc>) -> Vec<PresenceEntry> {
        let entries = self.entries.lock();
        let mut out: Vec<PresenceEntry> = entries
            .values()
            .filter(|e| e.room_id == room_id && self.is_live(e, now))
            .cloned()
            .collect();
        drop(entries);
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out
    }

    /// Live entries grouped by room, plus the number of distinct people.
    ///
    /// The people count deduplicates across rooms: a person tracked in two
    /// rooms counts once, attributed to the most recent sighting.
    pub fn snapshot_all(&self, now: DateTime<Utc>) -> (HashMap<i64, Vec<PresenceEntry>>, usize) {
        let live: Vec<PresenceEntry> = {
            let entries = self.entries.lock();
            entries
                .values()
                .filter(|e| self.is_live(e, now))
                .cloned()
                .collect()
        };

        let mut best: HashMap<i64, DateTime<Utc>> = HashMap::new();
        for entry in &live {
            best.entry(entry.person_id)
                .and_modify(|seen| {
                    if entry.last_seen > *seen {
                        *seen = entry.last_seen;
                    }
                })
                .or_insert(entry.last_seen);
        }
        let people = best.len();

        let mut rooms: HashMap<i64, Vec<PresenceEntry>> = HashMap::new();
        for entry in live {
            rooms.entry(entry.room_id).or_default().push(entry);
        }
        for list in rooms.values_mut() {
            list.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        }
        (rooms, people)
    }

    /// Where a person currently is, if anywhere. Multiple live rooms resolve
    /// to the most recent sighting.
    pub fn locate(&self, person_id: i64, now: DateTime<Utc>) -> Option<PresenceEntry> {
        let entries = self.entries.lock();
        entries
            .values()
            .filter(|e| e.person_id == person_id && self.is_live(e, now))
            .max_by_key(|e| e.last_seen)
            .cloned()
    }

    /// Remove every entry for a person (the person-deletion path), emitting
    /// a change for each affected room.
    pub fn remove_person(&self, person_id: i64) {
        let affected: Vec<i64> = {
            let mut entries = self.entries.lock();
            let rooms: Vec<i64> = entries
                .values()
                .filter(|e| e.person_id == person_id)
                .map(|e| e.room_id)
                .collect();
            entries.retain(|_, e| e.person_id != person_id);
            rooms
        };
        for room_id in affected {
            self.notify(room_id);
        }
    }

    /// Drop expired entries, emitting a change per room that lost members.
    /// The sweep is the only mutator besides `touch`.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> Vec<i64> {
        let mut affected: Vec<i64> = {
            let mut entries = self.entries.lock();
            let expired: Vec<i64> = entries
                .values()
                .filter(|e| !self.is_live(e, now))
                .map(|e| e.room_id)
                .collect();
            entries.retain(|_, e| now.signed_duration_since(e.last_seen)
                <= chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero()));
            expired
        };
        affected.sort_unstable();
        affected.dedup();

        if !affected.is_empty() {
            tracing::info!(rooms = affected.len(), "presence: evicted expired entries");
        }
        for &room_id in &affected {
            self.notify(room_id);
        }
        affected
    }
}

/// Periodic eviction sweep. Runs until cancelled.
pub async fn run_eviction_sweep(
    tracker: Arc<PresenceTracker>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tracker.evict_expired(Utc::now());
            }
        }
    }
    tracing::debug!("presence eviction sweep stopped");
}

/// JSON for one room's occupants, joined with student identity.
pub async fn room_presence_payload(
    store: &Store,
    tracker: &PresenceTracker,
    room_id: i64,
    room_name: &str,
    now: DateTime<Utc>,
) -> Result<serde_json::Value, StoreError> {
    let entries = tracker.snapshot(room_id, now);
    let occupants = occupants_json(store, &entries).await?;
    Ok(serde_json::json!({
        "room_id": room_id,
        "room_name": room_name,
        "occupants": occupants,
        "total_count": entries.len(),
    }))
}

/// Occupant objects for a list of presence entries.
pub async fn occupants_json(
    store: &Store,
    entries: &[PresenceEntry],
) -> Result<Vec<serde_json::Value>, StoreError> {
    let ids: Vec<i64> = entries.iter().map(|e| e.person_id).collect();
    let students = store.students_by_ids(ids).await?;
    let by_id: HashMap<i64, _> = students.into_iter().map(|s| (s.id, s)).collect();

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let student = by_id.get(&entry.person_id)?;
            Some(serde_json::json!({
                "student_id": student.id,
                "student_no": student.student_no,
                "first_name": student.first_name,
                "last_name": student.last_name,
                "group_name": student.group_name,
                "last_seen_at": entry.last_seen.to_rfc3339(),
                "confidence": entry.confidence,
                "camera_id": entry.camera_id,
            }))
        })
        .collect())
}

/// Full dashboard payload: every active room with occupants and the global
/// deduplicated people count.
pub async fn all_presence_payload(
    store: &Store,
    tracker: &PresenceTracker,
    now: DateTime<Utc>,
) -> Result<(Vec<serde_json::Value>, usize), StoreError> {
    let rooms = store.list_rooms(false).await?;
    let (_, total_people) = tracker.snapshot_all(now);

    let mut out = Vec::with_capacity(rooms.len());
    for room in rooms {
        out.push(room_presence_payload(store, tracker, room.id, &room.name, now).await?);
    }
    Ok((out, total_people))
}

/// Aggregator: turns room-change notifications into `presence_update`
/// events on `room:<id>` and `rooms:all`, and emits the periodic
/// `all_presence_refresh`.
pub async fn run_aggregator(
    store: Store,
    tracker: Arc<PresenceTracker>,
    hub: Arc<Hub>,
    mut changes: mpsc::UnboundedReceiver<RoomChange>,
    refresh_period: Duration,
    cancel: CancellationToken,
) {
    let mut refresh = tokio::time::interval(refresh_period);
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    refresh.reset(); // skip the immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => {
                let Some(change) = change else { break };
                if let Err(err) = publish_room_update(&store, &tracker, &hub, change.room_id).await {
                    tracing::warn!(room_id = change.room_id, error = %err, "presence update failed");
                }
            }
            _ = refresh.tick() => {
                match all_presence_payload(&store, &tracker, Utc::now()).await {
                    Ok((rooms, total_people)) => {
                        hub.publish_event("rooms:all", serde_json::json!({
                            "type": "all_presence_refresh",
                            "rooms": rooms,
                            "total_people": total_people,
                            "timestamp": Utc::now().to_rfc3339(),
                        }));
                    }
                    Err(err) => tracing::warn!(error = %err, "presence refresh failed"),
                }
            }
        }
    }
    tracing::debug!("presence aggregator stopped");
}

async fn publish_room_update(
    store: &Store,
    tracker: &PresenceTracker,
    hub: &Hub,
    room_id: i64,
) -> Result<(), StoreError> {
    let now = Utc::now();
    let room_name = match store.room_by_id(room_id).await? {
        Some(room) => room.name,
        None => return Ok(()), // room deleted while the change was in flight
    };

    let mut payload = room_presence_payload(store, tracker, room_id, &room_name, now).await?;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("type".into(), serde_json::json!("presence_update"));
        obj.insert("timestamp".into(), serde_json::json!(now.to_rfc3339()));
    }

    hub.publish_event(&format!("room:{room_id}"), payload.clone());
    hub.publish_event("rooms:all", payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tracker() -> (Arc<PresenceTracker>, mpsc::UnboundedReceiver<RoomChange>) {
        PresenceTracker::new(Duration::from_secs(30))
    }

    #[test]
    fn test_touch_added_then_refreshed() {
        let (t, _rx) = tracker();
        assert_eq!(t.touch(1, 10, 100, at(0), 0.9), TouchOutcome::Added);
        assert_eq!(t.touch(1, 10, 100, at(5), 0.8), TouchOutcome::Refreshed);
    }

    #[test]
    fn test_touch_after_expiry_is_added_again() {
        let (t, mut rx) = tracker();
        t.touch(1, 10, 100, at(0), 0.9);
        assert_eq!(t.touch(1, 10, 100, at(31), 0.9), TouchOutcome::Added);

        // Both sightings produced a room change.
        assert_eq!(rx.try_recv().unwrap().room_id, 1);
        assert_eq!(rx.try_recv().unwrap().room_id, 1);
    }

    #[test]
    fn test_snapshot_excludes_expired() {
        let (t, _rx) = tracker();
        t.touch(1, 10, 100, at(0), 0.9);
        t.touch(1, 11, 100, at(20), 0.9);

        // At t=35, person 10 (age 35s) is gone, person 11 (age 15s) remains.
        let snap = t.snapshot(1, at(35));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].person_id, 11);

        // Exactly at the TTL boundary the entry is still live.
        let snap = t.snapshot(1, at(30));
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn test_snapshot_sorted_most_recent_first() {
        let (t, _rx) = tracker();
        t.touch(1, 10, 100, at(0), 0.9);
        t.touch(1, 11, 100, at(5), 0.9);
        let snap = t.snapshot(1, at(10));
        assert_eq!(snap[0].person_id, 11);
        assert_eq!(snap[1].person_id, 10);
    }

    #[test]
    fn test_cross_camera_collapse_same_room() {
        let (t, _rx) = tracker();
        t.touch(1, 10, 100, at(0), 0.9);
        t.touch(1, 10, 200, at(1), 0.8);

        let snap = t.snapshot(1, at(2));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].camera_id, 200); // most recent camera wins
    }

    #[test]
    fn test_locate_prefers_most_recent_room() {
        let (t, _rx) = tracker();
        t.touch(1, 10, 100, at(0), 0.9);
        t.touch(2, 10, 200, at(5), 0.9);

        let entry = t.locate(10, at(10)).unwrap();
        assert_eq!(entry.room_id, 2);

        // Once both are stale, the person is nowhere.
        assert!(t.locate(10, at(120)).is_none());
    }

    #[test]
    fn test_snapshot_all_dedups_people() {
        let (t, _rx) = tracker();
        t.touch(1, 10, 100, at(0), 0.9);
        t.touch(2, 10, 200, at(1), 0.9);
        t.touch(2, 11, 200, at(2), 0.9);

        let (rooms, people) = t.snapshot_all(at(5));
        assert_eq!(rooms[&1].len(), 1);
        assert_eq!(rooms[&2].len(), 2);
        assert_eq!(people, 2); // person 10 counted once
    }

    #[test]
    fn test_eviction_emits_room_change() {
        let (t, mut rx) = tracker();
        t.touch(1, 10, 100, at(0), 0.9);
        t.touch(2, 11, 200, at(0), 0.9);
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        let affected = t.evict_expired(at(31));
        assert_eq!(affected, vec![1, 2]);
        assert!(t.snapshot(1, at(31)).is_empty());

        let mut changed: Vec<i64> = vec![
            rx.try_recv().unwrap().room_id,
            rx.try_recv().unwrap().room_id,
        ];
        changed.sort_unstable();
        assert_eq!(changed, vec![1, 2]);
    }

    #[test]
    fn test_eviction_noop_when_fresh() {
        let (t, mut rx) = tracker();
        t.touch(1, 10, 100, at(0), 0.9);
        rx.try_recv().unwrap();

        assert!(t.evict_expired(at(10)).is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remove_person_clears_all_rooms() {
        let (t, mut rx) = tracker();
        t.touch(1, 10, 100, at(0), 0.9);
        t.touch(2, 10, 200, at(1), 0.9);
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        t.remove_person(10);
        assert!(t.locate(10, at(2)).is_none());
        // One change per affected room.
        let mut changed = vec![
            rx.try_recv().unwrap().room_id,
            rx.try_recv().unwrap().room_id,
        ];
        changed.sort_unstable();
        assert_eq!(changed, vec![1, 2]);
    }
}

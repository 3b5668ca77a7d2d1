//! Camera worker: one long-lived task per started camera.
//!
//! Lifecycle:
//!
//! ```text
//! offline ──start──▶ connecting ──frame ok──▶ streaming
//!                   │                         │
//!                   └──fail/timeout──▶ failed │
//!                                             ▼
//!                                          stopped ◀── stop
//!                     failed ──retry (backoff)──▶ connecting
//! ```
//!
//! The supervisor loop owns reconnection; the frame loop never calls back
//! into it. Cancellation is observed at every await point, so `stop` is
//! bounded by the manager's grace timeout plus a hard abort.

use crate::config::Config;
use crate::events::{CameraState, RecognitionEvent, RecognitionStatus, RecognizedPerson, WorkerStatus};
use crate::gate::{AttendanceGate, CheckOutcome};
use crate::hub::Hub;
use crate::presence::PresenceTracker;
use crate::store::{Camera, Store};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use vigil_core::RecognitionEngine;
use vigil_stream::{Frame, FrameConnector, FrameSource};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Dependencies shared by every camera worker.
pub struct WorkerContext {
    pub engine: Arc<RecognitionEngine>,
    pub gate: AttendanceGate,
    pub presence: Arc<PresenceTracker>,
    pub hub: Arc<Hub>,
    pub store: Store,
    pub connector: Arc<dyn FrameConnector>,
    pub snapshots_dir: PathBuf,
    pub connect_timeout: Duration,
    pub image_timeout: Duration,
    pub event_cooldown: Duration,
    pub persistence_fail_window: Duration,
    pub recognition_hz: f32,
    pub stream_max_hz: f32,
}

impl WorkerContext {
    pub fn new(
        engine: Arc<RecognitionEngine>,
        gate: AttendanceGate,
        presence: Arc<PresenceTracker>,
        hub: Arc<Hub>,
        store: Store,
        connector: Arc<dyn FrameConnector>,
        config: &Config,
    ) -> Self {
        Self {
            engine,
            gate,
            presence,
            hub,
            store,
            connector,
            snapshots_dir: config.snapshots_dir(),
            connect_timeout: config.connect_timeout,
            image_timeout: config.image_timeout,
            event_cooldown: config.event_cooldown,
            persistence_fail_window: config.persistence_fail_window,
            recognition_hz: config.recognition_hz,
            stream_max_hz: config.stream_max_hz,
        }
    }
}

/// Why the frame loop returned to the supervisor.
enum LoopExit {
    Stopped,
    SourceLost,
    PersistenceDown,
}

/// Spawned per camera; drives the state machine until cancelled.
pub async fn run_worker(
    ctx: Arc<WorkerContext>,
    camera: Camera,
    cancel: CancellationToken,
    status_tx: watch::Sender<WorkerStatus>,
) {
    let topic = format!("camera:{}", camera.id);
    let mut backoff = BACKOFF_INITIAL;
    // Cooldowns survive reconnects: a flapping stream must not re-emit.
    let mut cooldowns: HashMap<i64, Instant> = HashMap::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        set_state(&status_tx, &ctx.hub, &topic, camera.id, CameraState::Connecting);
        tracing::info!(camera_id = camera.id, url = %camera.stream_url, "camera connecting");

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = timeout(ctx.connect_timeout, ctx.connector.connect(&camera.stream_url)) => result,
        };

        let mut source = match connected {
            Ok(Ok(source)) => source,
            Ok(Err(err)) => {
                tracing::warn!(camera_id = camera.id, error = %err, "camera connect failed");
                set_state(&status_tx, &ctx.hub, &topic, camera.id, CameraState::Failed);
                if !sleep_backoff(&cancel, &mut backoff).await {
                    break;
                }
                continue;
            }
            Err(_) => {
                tracing::warn!(
                    camera_id = camera.id,
                    timeout_secs = ctx.connect_timeout.as_secs(),
                    "camera connect timed out"
                );
                set_state(&status_tx, &ctx.hub, &topic, camera.id, CameraState::Failed);
                if !sleep_backoff(&cancel, &mut backoff).await {
                    break;
                }
                continue;
            }
        };

        backoff = BACKOFF_INITIAL;
        set_state(&status_tx, &ctx.hub, &topic, camera.id, CameraState::Streaming);
        tracing::info!(camera_id = camera.id, "camera streaming");

        match frame_loop(&ctx, &camera, &topic, source.as_mut(), &cancel, &status_tx, &mut cooldowns)
            .await
        {
            LoopExit::Stopped => break,
            LoopExit::SourceLost => {
                tracing::warn!(camera_id = camera.id, "frame source lost");
                set_state(&status_tx, &ctx.hub, &topic, camera.id, CameraState::Failed);
                if !sleep_backoff(&cancel, &mut backoff).await {
                    break;
                }
            }
            LoopExit::PersistenceDown => {
                tracing::error!(camera_id = camera.id, "persistence outage exceeded window");
                set_state(&status_tx, &ctx.hub, &topic, camera.id, CameraState::Failed);
                if !sleep_backoff(&cancel, &mut backoff).await {
                    break;
                }
            }
        }
        // Dropping the source here releases the stream before reconnecting.
    }

    set_state(&status_tx, &ctx.hub, &topic, camera.id, CameraState::Offline);
    tracing::info!(camera_id = camera.id, "camera worker stopped");
}

fn set_state(
    status_tx: &watch::Sender<WorkerStatus>,
    hub: &Hub,
    topic: &str,
    camera_id: i64,
    state: CameraState,
) {
    status_tx.send_modify(|status| status.state = state);
    let snapshot = status_tx.borrow().clone();
    hub.publish_event(topic, snapshot.to_event(camera_id));
}

/// Sleep for the current backoff (respecting cancel), then double it.
/// Returns false if cancelled.
async fn sleep_backoff(cancel: &CancellationToken, backoff: &mut Duration) -> bool {
    let wait = *backoff;
    *backoff = (*backoff * 2).min(BACKOFF_CAP);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

#[allow(clippy::too_many_arguments)]
async fn frame_loop(
    ctx: &WorkerContext,
    camera: &Camera,
    topic: &str,
    source: &mut dyn FrameSource,
    cancel: &CancellationToken,
    status_tx: &watch::Sender<WorkerStatus>,
    cooldowns: &mut HashMap<i64, Instant>,
) -> LoopExit {
    let frame_gap = Duration::from_secs_f32(1.0 / ctx.stream_max_hz.max(0.001));
    let recognition_gap = Duration::from_secs_f32(1.0 / ctx.recognition_hz.max(0.001));

    let mut last_frame_publish: Option<Instant> = None;
    let mut last_recognition: Option<Instant> = None;
    let mut store_down_since: Option<Instant> = None;

    let mut window_start = Instant::now();
    let mut frames_in_window = 0u32;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return LoopExit::Stopped,
            frame = source.next_frame() => match frame {
                Ok(frame) => frame,
                Err(_) => return LoopExit::SourceLost,
            },
        };
        let now = Instant::now();

        // FPS accounting: one-second windows.
        frames_in_window += 1;
        status_tx.send_modify(|status| status.frame_count += 1);
        let window_age = now.duration_since(window_start);
        if window_age >= Duration::from_secs(1) {
            let fps = frames_in_window as f32 / window_age.as_secs_f32();
            status_tx.send_modify(|status| status.fps = fps);
            window_start = now;
            frames_in_window = 0;
        }

        // Raw frames flow at source FPS, capped, and only when watched.
        let due = last_frame_publish.map_or(true, |t| now.duration_since(t) >= frame_gap);
        if due && ctx.hub.subscriber_count(topic) > 0 {
            ctx.hub.publish_frame(topic, frame.jpeg.clone());
            last_frame_publish = Some(now);
        }

        // Recognition runs at its own, lower rate.
        let rec_due = last_recognition.map_or(true, |t| now.duration_since(t) >= recognition_gap);
        if !rec_due {
            continue;
        }
        last_recognition = Some(now);

        let matches = match recognize_frame(ctx, &frame).await {
            Some(matches) => matches,
            None => continue,
        };
        if matches.is_empty() {
            continue;
        }

        let mut event_entries: Vec<(i64, f32, CheckOutcome)> = Vec::new();
        let wall_now = Utc::now();
        for m in &matches {
            // Presence is refreshed on every sighting, cooldown or not.
            ctx.presence
                .touch(camera.room_id, m.person_id, camera.id, wall_now, m.confidence);

            let in_cooldown = cooldowns
                .get(&m.person_id)
                .is_some_and(|t| now.duration_since(*t) < ctx.event_cooldown);
            if in_cooldown {
                continue;
            }

            let student_no = match ctx.store.student_by_id(m.person_id).await {
                Ok(Some(student)) => student.student_no,
                Ok(None) => continue, // deleted mid-stream
                Err(err) => {
                    if persistence_failing(&mut store_down_since, ctx.persistence_fail_window) {
                        return LoopExit::PersistenceDown;
                    }
                    tracing::warn!(camera_id = camera.id, error = %err, "store lookup failed");
                    continue;
                }
            };

            match ctx
                .gate
                .record_with_snapshot(
                    m.person_id,
                    &student_no,
                    m.confidence,
                    wall_now,
                    &frame.jpeg,
                    &ctx.snapshots_dir,
                )
                .await
            {
                Ok(outcome) => {
                    store_down_since = None;
                    cooldowns.insert(m.person_id, now);
                    event_entries.push((m.person_id, m.confidence, outcome));
                }
                Err(err) => {
                    if persistence_failing(&mut store_down_since, ctx.persistence_fail_window) {
                        return LoopExit::PersistenceDown;
                    }
                    tracing::warn!(camera_id = camera.id, error = %err, "attendance write failed");
                }
            }
        }

        if !event_entries.is_empty() {
            publish_recognitions(ctx, camera, topic, event_entries).await;
        }
    }
}

/// Track the start of a store outage; true once it exceeds the window.
fn persistence_failing(since: &mut Option<Instant>, window: Duration) -> bool {
    let start = *since.get_or_insert_with(Instant::now);
    start.elapsed() > window
}

/// Decode + recognize off the runtime, bounded by the image timeout.
async fn recognize_frame(ctx: &WorkerContext, frame: &Frame) -> Option<Vec<vigil_core::Match>> {
    let engine = ctx.engine.clone();
    let frame = frame.clone();
    let work = tokio::task::spawn_blocking(move || {
        let (rgb, width, height) = match frame.decode_rgb() {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::debug!(error = %err, "frame decode failed");
                return None;
            }
        };
        match engine.recognize(&rgb, width, height) {
            Ok(matches) => Some(matches),
            Err(err) => {
                tracing::warn!(error = %err, "recognition failed");
                None
            }
        }
    });

    match timeout(ctx.image_timeout, work).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            tracing::error!(error = %join_err, "recognition task failed");
            None
        }
        Err(_) => {
            tracing::warn!("recognition timed out; frame skipped");
            None
        }
    }
}

/// Build and publish the `{type:"recognition"}` event for cooldown-passing
/// matches.
async fn publish_recognitions(
    ctx: &WorkerContext,
    camera: &Camera,
    topic: &str,
    entries: Vec<(i64, f32, CheckOutcome)>,
) {
    let ids: Vec<i64> = entries.iter().map(|(id, _, _)| *id).collect();
    let students = match ctx.store.students_by_ids(ids).await {
        Ok(students) => students,
        Err(err) => {
            tracing::warn!(error = %err, "student lookup for event failed");
            return;
        }
    };
    let by_id: HashMap<i64, _> = students.into_iter().map(|s| (s.id, s)).collect();

    let recognized: Vec<RecognizedPerson> = entries
        .into_iter()
        .filter_map(|(person_id, confidence, outcome)| {
            let person = by_id.get(&person_id)?.clone();
            let check_in_time = match &outcome {
                CheckOutcome::Created { check_in_time, .. }
                | CheckOutcome::Already { check_in_time } => {
                    Some(check_in_time.format("%H:%M:%S").to_string())
                }
                CheckOutcome::Suppressed => None,
            };
            Some(RecognizedPerson {
                person,
                confidence,
                status: RecognitionStatus::from(&outcome),
                check_in_time,
            })
        })
        .collect();

    if recognized.is_empty() {
        return;
    }

    let event = RecognitionEvent {
        camera_id: camera.id,
        recognized,
        timestamp: Utc::now().to_rfc3339(),
    };
    tracing::info!(
        camera_id = camera.id,
        count = event.recognized.len(),
        "recognition event"
    );
    ctx.hub.publish_event(topic, event.to_event());
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hub::{Interest, Message};
    use crate::store::testutil::temp_store;
    use crate::store::NewStudent;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::RwLock;
    use tokio::sync::mpsc;
    use vigil_core::{
        BoundingBox, DetectedFace, Embedding, EmbeddingProvider, FaceIndex, ProviderError,
        EMBEDDING_DIM,
    };
    use vigil_stream::StreamError;

    /// Source driven by a test-owned channel.
    pub struct ChannelSource {
        rx: mpsc::UnboundedReceiver<Frame>,
    }

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn next_frame(&mut self) -> Result<Frame, StreamError> {
            self.rx.recv().await.ok_or(StreamError::Disconnected)
        }
    }

    /// Connector handing out channel-backed sources, one per connect call.
    pub struct ChannelConnector {
        sources: parking_lot::Mutex<Vec<ChannelSource>>,
    }

    impl ChannelConnector {
        pub fn single() -> (Arc<Self>, mpsc::UnboundedSender<Frame>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    sources: parking_lot::Mutex::new(vec![ChannelSource { rx }]),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl FrameConnector for ChannelConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn FrameSource>, StreamError> {
            match self.sources.lock().pop() {
                Some(source) => Ok(Box::new(source)),
                None => Err(StreamError::Connect("no more scripted sources".into())),
            }
        }
    }

    /// Provider that always sees one face belonging to the enrolled axis.
    struct ConstantProvider {
        axis: usize,
    }

    impl EmbeddingProvider for ConstantProvider {
        fn detect(
            &self,
            _rgb: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, ProviderError> {
            let mut values = vec![0.0; EMBEDDING_DIM];
            values[self.axis] = 1.0;
            Ok(vec![DetectedFace {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 200.0,
                    height: 200.0,
                    confidence: 0.95,
                    landmarks: None,
                },
                quality: 0.95,
                embedding: Embedding::from_values(values),
            }])
        }
    }

    pub fn test_jpeg() -> Bytes {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([120, 120, 120]));
        let mut buf = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 85)
            .encode(img.as_raw(), 4, 4, image::ColorType::Rgb8)
            .unwrap();
        Bytes::from(buf)
    }

    struct Fixture {
        ctx: Arc<WorkerContext>,
        store: Store,
        hub: Arc<Hub>,
        presence: Arc<PresenceTracker>,
        person_id: i64,
        _dir: tempfile::TempDir,
    }

    async fn fixture(connector: Arc<dyn FrameConnector>, cooldown: Duration) -> Fixture {
        let (store, dir) = temp_store();
        let person_id = store
            .create_student(NewStudent {
                student_no: "2024001".into(),
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                group_name: None,
            })
            .await
            .unwrap()
            .id;

        let mut index = FaceIndex::new(EMBEDDING_DIM);
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[0] = 1.0;
        index.add(person_id, &Embedding::from_values(values)).unwrap();
        let index = Arc::new(RwLock::new(index));

        let engine = Arc::new(RecognitionEngine::new(
            Arc::new(ConstantProvider { axis: 0 }),
            index,
            0.5,
            100.0,
            0.6,
        ));
        let gate = AttendanceGate::new(
            store.clone(),
            0.6,
            chrono::FixedOffset::east_opt(0).unwrap(),
        );
        let (presence, _changes) = PresenceTracker::new(Duration::from_secs(30));
        let hub = Arc::new(Hub::new(64));

        let ctx = Arc::new(WorkerContext {
            engine,
            gate,
            presence: presence.clone(),
            hub: hub.clone(),
            store: store.clone(),
            connector,
            snapshots_dir: dir.path().join("snapshots"),
            connect_timeout: Duration::from_secs(5),
            image_timeout: Duration::from_secs(5),
            event_cooldown: cooldown,
            persistence_fail_window: Duration::from_secs(30),
            recognition_hz: 1000.0,
            stream_max_hz: 1000.0,
        });

        Fixture {
            ctx,
            store,
            hub,
            presence,
            person_id,
            _dir: dir,
        }
    }

    fn camera() -> Camera {
        Camera {
            id: 1,
            room_id: 7,
            name: "door".into(),
            stream_url: "test://".into(),
            is_active: true,
            created_at: String::new(),
        }
    }

    fn spawn(fx: &Fixture) -> (CancellationToken, tokio::task::JoinHandle<()>, watch::Receiver<WorkerStatus>) {
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(WorkerStatus::offline());
        let handle = tokio::spawn(run_worker(
            fx.ctx.clone(),
            camera(),
            cancel.clone(),
            status_tx,
        ));
        (cancel, handle, status_rx)
    }

    async fn drain_events(sub: &crate::hub::Subscription, kind: &str) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Ok(envelope) =
            tokio::time::timeout(Duration::from_millis(50), sub.recv()).await
        {
            if let Message::Event(value) = envelope.message {
                if value["type"] == kind {
                    events.push((*value).clone());
                }
            }
        }
        events
    }

    #[tokio::test]
    async fn test_cooldown_emits_one_event_per_window() {
        let (connector, frames) = ChannelConnector::single();
        let fx = fixture(connector, Duration::from_secs(3600)).await;
        let sub = fx.hub.subscribe("camera:1", Interest::Events);
        let (cancel, handle, _status) = spawn(&fx);

        // A burst of matching frames within one cooldown window.
        for _ in 0..6 {
            frames.send(Frame::new(test_jpeg(), 0)).unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let events = drain_events(&sub, "recognition").await;
        assert_eq!(events.len(), 1, "one recognition event per cooldown window");
        assert_eq!(events[0]["recognized"][0]["status"], "success");

        // Attendance was recorded exactly once.
        let day = chrono::Utc::now().date_naive();
        assert!(fx
            .store
            .attendance_for_day(fx.person_id, day)
            .await
            .unwrap()
            .is_some());

        // Presence refreshed on every sighting regardless of cooldown.
        assert!(fx.presence.locate(fx.person_id, Utc::now()).is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cooldown_expiry_emits_again() {
        let (connector, frames) = ChannelConnector::single();
        let fx = fixture(connector, Duration::from_millis(200)).await;
        let sub = fx.hub.subscribe("camera:1", Interest::Events);
        let (cancel, handle, _status) = spawn(&fx);

        frames.send(Frame::new(test_jpeg(), 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Still inside the cooldown: no second event.
        frames.send(Frame::new(test_jpeg(), 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        // Past the cooldown: a new event (already_attended now).
        frames.send(Frame::new(test_jpeg(), 2)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let events = drain_events(&sub, "recognition").await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["recognized"][0]["status"], "success");
        assert_eq!(events[1]["recognized"][0]["status"], "already_attended");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_status_transitions_and_frames_published() {
        let (connector, frames) = ChannelConnector::single();
        let fx = fixture(connector, Duration::from_secs(3600)).await;
        let frame_sub = fx.hub.subscribe("camera:1", Interest::Frames);
        let (cancel, handle, status) = spawn(&fx);

        frames.send(Frame::new(test_jpeg(), 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(status.borrow().state, CameraState::Streaming);

        frames.send(Frame::new(test_jpeg(), 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let envelope = tokio::time::timeout(Duration::from_millis(200), frame_sub.recv())
            .await
            .expect("raw frame published");
        assert!(matches!(envelope.message, Message::Frame(_)));

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(status.borrow().state, CameraState::Offline);
    }

    #[tokio::test]
    async fn test_stop_bound_with_idle_source() {
        // Source that never produces: stop must still complete fast.
        let (connector, _frames) = ChannelConnector::single();
        let fx = fixture(connector, Duration::from_secs(3600)).await;
        let (cancel, handle, _status) = spawn(&fx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker exited within grace")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_connect_failure_goes_failed_then_retries() {
        // Connector with no sources at all: every connect fails.
        let connector = Arc::new(ChannelConnector {
            sources: parking_lot::Mutex::new(Vec::new()),
        });
        let fx = fixture(connector, Duration::from_secs(3600)).await;
        let (cancel, handle, status) = spawn(&fx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(status.borrow().state, CameraState::Failed);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(status.borrow().state, CameraState::Offline);
    }
}

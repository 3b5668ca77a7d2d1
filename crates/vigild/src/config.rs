use chrono::{FixedOffset, Offset};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from `VIGIL_*` environment variables.
#[derive(Clone)]
pub struct Config {
    /// Root for the database, images and index artifacts.
    pub data_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// HTTP listen address.
    pub http_addr: String,

    /// Cosine similarity threshold for a positive match.
    pub confidence_threshold: f32,
    /// Confidence floor for recording attendance; never below the match threshold.
    pub attendance_min: f32,
    /// Minimum detection quality for an enrollment image.
    pub enroll_min_quality: f32,
    /// Minimum detection quality during live recognition.
    pub recognize_min_quality: f32,
    /// Minimum face bbox area (px²) considered at all.
    pub min_face_area: f32,

    /// How often one camera runs recognition.
    pub recognition_hz: f32,
    /// Cap on published raw frames per camera.
    pub stream_max_hz: f32,
    /// Per (camera, person) interval between emitted recognition events.
    pub event_cooldown: Duration,
    /// How long an unseen person stays in a room snapshot.
    pub presence_ttl: Duration,
    /// Presence eviction sweep period.
    pub eviction_period: Duration,
    /// Periodic all-rooms refresh on the dashboard socket.
    pub refresh_period: Duration,
    /// Bound on frame-source connection attempts.
    pub connect_timeout: Duration,
    /// Bound on worker shutdown.
    pub shutdown_grace: Duration,
    /// Per-subscription queue capacity in the hub.
    pub subscriber_queue: usize,
    /// Bound on one image decode+inference pass.
    pub image_timeout: Duration,
    /// How long persistence may stay down before a worker fails.
    pub persistence_fail_window: Duration,

    /// Enrollment image cap per person.
    pub max_images_per_person: usize,
    /// Cap on simultaneously streaming cameras.
    pub max_streams: usize,
    /// Cap on cameras per room.
    pub max_cameras_per_room: usize,

    /// Zone for the attendance calendar-day boundary.
    ///
    /// A fixed UTC offset, deliberately not a named zone: with a fixed
    /// offset every calendar day is exactly 24 h and the once-per-day
    /// uniqueness window never stretches or shrinks across a DST
    /// transition. Deployments that want wall-clock alignment in a DST
    /// region must update `VIGIL_UTC_OFFSET` themselves.
    pub utc_offset: FixedOffset,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("VIGIL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./vigil-data"));
        let model_dir = std::env::var("VIGIL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./models"));

        let confidence_threshold = env_f32("VIGIL_CONFIDENCE_THRESHOLD", 0.6);
        let attendance_min =
            env_f32("VIGIL_ATTENDANCE_MIN", confidence_threshold).max(confidence_threshold);

        let presence_ttl = env_secs("VIGIL_PRESENCE_TTL_SECS", 30);
        // The sweep must run at least twice per TTL or snapshots would do
        // all the filtering work.
        let eviction_period = env_secs("VIGIL_EVICTION_PERIOD_SECS", 10).min(presence_ttl / 2);

        Self {
            data_dir,
            model_dir,
            http_addr: std::env::var("VIGIL_HTTP_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            confidence_threshold,
            attendance_min,
            enroll_min_quality: env_f32("VIGIL_ENROLL_MIN_QUALITY", 0.5),
            recognize_min_quality: env_f32("VIGIL_RECOGNIZE_MIN_QUALITY", 0.5),
            min_face_area: env_f32("VIGIL_MIN_FACE_AREA", 3600.0),
            recognition_hz: env_f32("VIGIL_RECOGNITION_HZ", 3.0),
            stream_max_hz: env_f32("VIGIL_STREAM_MAX_HZ", 30.0),
            event_cooldown: env_secs("VIGIL_EVENT_COOLDOWN_SECS", 10),
            presence_ttl,
            eviction_period,
            refresh_period: env_secs("VIGIL_REFRESH_PERIOD_SECS", 30),
            connect_timeout: env_secs("VIGIL_CONNECT_TIMEOUT_SECS", 30),
            shutdown_grace: env_secs("VIGIL_SHUTDOWN_GRACE_SECS", 5),
            subscriber_queue: env_usize("VIGIL_SUBSCRIBER_QUEUE", 32),
            image_timeout: env_secs("VIGIL_IMAGE_TIMEOUT_SECS", 10),
            persistence_fail_window: env_secs("VIGIL_PERSISTENCE_FAIL_WINDOW_SECS", 30),
            max_images_per_person: env_usize("VIGIL_MAX_IMAGES_PER_PERSON", 10),
            max_streams: env_usize("VIGIL_MAX_STREAMS", 20),
            max_cameras_per_room: env_usize("VIGIL_MAX_CAMERAS_PER_ROOM", 10),
            utc_offset: parse_offset(
                &std::env::var("VIGIL_UTC_OFFSET").unwrap_or_else(|_| "+00:00".to_string()),
            ),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("vigil.db")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.images_dir().join("attendance")
    }

    pub fn index_vectors_path(&self) -> PathBuf {
        self.data_dir.join("index").join("vectors.bin")
    }

    pub fn index_slots_path(&self) -> PathBuf {
        self.data_dir.join("index").join("slots.json")
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

/// Parse "+HH:MM" / "-HH:MM" into a fixed offset; bad input falls back to UTC.
fn parse_offset(s: &str) -> FixedOffset {
    let parsed = (|| {
        let (sign, rest) = match s.as_bytes().first()? {
            b'+' => (1i32, &s[1..]),
            b'-' => (-1i32, &s[1..]),
            _ => (1i32, s),
        };
        let (h, m) = rest.split_once(':')?;
        let hours: i32 = h.parse().ok()?;
        let minutes: i32 = m.parse().ok()?;
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
    })();

    parsed.unwrap_or_else(|| {
        tracing::warn!(offset = s, "invalid VIGIL_UTC_OFFSET; using +00:00");
        chrono::Utc.fix()
    })
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offset_positive() {
        let off = parse_offset("+05:00");
        assert_eq!(off.local_minus_utc(), 5 * 3600);
    }

    #[test]
    fn test_parse_offset_negative_with_minutes() {
        let off = parse_offset("-03:30");
        assert_eq!(off.local_minus_utc(), -(3 * 3600 + 30 * 60));
    }

    #[test]
    fn test_parse_offset_garbage_is_utc() {
        assert_eq!(parse_offset("tomorrow").local_minus_utc(), 0);
    }
}

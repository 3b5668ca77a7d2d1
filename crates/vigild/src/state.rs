//! Application root: every shared service, owned once and threaded into
//! handlers and workers explicitly.

use crate::config::Config;
use crate::enroll::EnrollmentCoordinator;
use crate::gate::AttendanceGate;
use crate::hub::Hub;
use crate::presence::PresenceTracker;
use crate::store::Store;
use crate::workers::WorkerManager;
use parking_lot::RwLock;
use std::sync::Arc;
use vigil_core::{EmbeddingProvider, FaceIndex, RecognitionEngine};

pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub index: Arc<RwLock<FaceIndex>>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub engine: Arc<RecognitionEngine>,
    pub coordinator: EnrollmentCoordinator,
    pub gate: AttendanceGate,
    pub presence: Arc<PresenceTracker>,
    pub hub: Arc<Hub>,
    pub workers: WorkerManager,
}

pub type SharedState = Arc<AppState>;

use allocguard_tracker::{AllocError, TrackerError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
    #[error("tracker violation: {0}")]
    Tracker(#[from] TrackerError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stress worker {worker} panicked")]
    WorkerPanicked { worker: usize },
    #[error("worker {worker} read back {found:#04x} where it wrote {expected:#04x}")]
    PayloadCorrupted { worker: usize, expected: u8, found: u8 },
    #[error("{requested} controllers requested, at most {max} are addressable")]
    TooManyControllers { requested: usize, max: usize },
}

use std::sync::Arc;

use chunkyard::UploadCoordinator;

/// Shared handler state
#[derive(Clone)]
pub struct UploadState {
    pub coordinator: Arc<UploadCoordinator>,
}

impl UploadState {
    pub fn new(coordinator: Arc<UploadCoordinator>) -> Self {
        Self { coordinator }
    }
}

use std::sync::Arc;
use std::time::Instant;

use crate::coordinator::FieldCoordinator;

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    coordinator: Arc<FieldCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<FieldCoordinator>) -> Self {
        Self {
            start: Instant::now(),
            coordinator,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn coordinator(&self) -> &Arc<FieldCoordinator> {
        &self.coordinator
    }
}

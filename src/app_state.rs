use std::sync::Arc;

use crate::auth::JwtVerifier;
use crate::db::repository::JobRepository;
use crate::services::dispatcher::{Dispatcher, DispatcherSettings};
use crate::services::queue::TaskQueue;
use crate::services::storage::ObjectStorage;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobRepository>,
    pub queue: Arc<dyn TaskQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub auth: Arc<JwtVerifier>,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        storage: Arc<dyn ObjectStorage>,
        queue: Arc<dyn TaskQueue>,
        auth: JwtVerifier,
        settings: DispatcherSettings,
    ) -> Self {
        let dispatcher = Dispatcher::new(jobs.clone(), storage, queue.clone(), settings);
        Self {
            jobs,
            queue,
            dispatcher: Arc::new(dispatcher),
            auth: Arc::new(auth),
        }
    }
}

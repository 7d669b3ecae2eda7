use std::sync::Arc;

use common::{storage::db::SurrealDbClient, utils::config::AppConfig};
use generation_pipeline::JobCoordinator;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub coordinator: Arc<JobCoordinator>,
}

impl ApiState {
    pub fn new(
        config: &AppConfig,
        db: Arc<SurrealDbClient>,
        coordinator: Arc<JobCoordinator>,
    ) -> Self {
        Self {
            db,
            config: config.clone(),
            coordinator,
        }
    }
}

use axum::extract::FromRef;
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::RecorderConfig;
use crate::services::producer::ProducerRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: RecorderConfig,
    pub db: PgPool,
    pub producers: Arc<ProducerRegistry>,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}

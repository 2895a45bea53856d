use std::sync::Arc;

use crate::config::RecorderConfig;
use crate::db;
use crate::services::producer::{ProducerRegistry, SamplerProducer};
use crate::state::AppState;
use crate::units::UnitSystem;

pub fn test_config() -> RecorderConfig {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let data_root = tempdir.keep();

    RecorderConfig {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        data_root,
        compile_interval_seconds: 300,
        timezone: chrono_tz::UTC,
        unit_system: UnitSystem::Metric,
    }
}

pub fn test_state() -> AppState {
    let config = test_config();
    let pool = db::connect_lazy(&config.database_url).expect("connect_lazy");

    let mut producers = ProducerRegistry::new();
    producers.register(Arc::new(SamplerProducer));

    AppState {
        config,
        db: pool,
        producers: Arc::new(producers),
    }
}

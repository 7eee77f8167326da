use crate::services::dispatcher::EventQueue;
use crate::services::rate_limit::RateLimiter;
use crate::{Config, Database};
use anyhow::Result;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub rate_limiter: Arc<RateLimiter>,
    pub events: EventQueue,
}

impl AppState {
    pub fn new(config: Config, db: Database, events: EventQueue) -> Result<Self> {
        let rate_limiter = Arc::new(RateLimiter::from_settings(&config.rate_limit)?);

        Ok(Self {
            config,
            db,
            rate_limiter,
            events,
        })
    }
}

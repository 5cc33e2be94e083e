use crate::config::DatabaseConfig;
use crate::error::Error;
use anyhow::Result;
use log::info;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub mod migrations;
pub mod models;
pub mod repositories;
pub mod store;

pub use store::{AlarmStore, ContactDirectory, NotificationStore};

/// Database service for handling connections and migrations
pub struct DatabaseService {
    pub pool: Arc<PgPool>,
}

impl DatabaseService {
    /// Connect to PostgreSQL and optionally run migrations
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Initializing database service");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect to database: {}", e)))?;

        info!("Connected to PostgreSQL database");

        let service = Self {
            pool: Arc::new(pool),
        };

        if config.auto_migrate {
            service.run_migrations().await?;
        }

        Ok(service)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run_migrations(&self.pool).await
    }
}

use crate::db::models::{ChannelKind, EmergencyContact};
use crate::db::store::ContactDirectory;
use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

/// Contacts repository over the `emergency_contacts` table. The dispatcher
/// only reads it; contact management belongs to the surrounding backend.
#[derive(Clone)]
pub struct ContactsRepository {
    pool: Arc<PgPool>,
}

impl ContactsRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactDirectory for ContactsRepository {
    async fn contacts_for(&self, subject_id: Uuid) -> Result<Vec<EmergencyContact>> {
        let rows = sqlx::query(
            r#"
            SELECT id, subject_id, name, alert_level, channels, enabled
            FROM emergency_contacts
            WHERE subject_id = $1
            ORDER BY alert_level ASC, name ASC
            "#,
        )
        .bind(subject_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fetch contacts: {}", e)))?;

        rows.iter()
            .map(|row| {
                let channels: Vec<String> = row.try_get("channels")?;
                Ok(EmergencyContact {
                    id: row.try_get("id")?,
                    subject_id: row.try_get("subject_id")?,
                    name: row.try_get("name")?,
                    alert_level: row.try_get("alert_level")?,
                    channels: channels
                        .iter()
                        .map(|c| c.parse::<ChannelKind>())
                        .collect::<Result<Vec<_>, _>>()?,
                    enabled: row.try_get("enabled")?,
                })
            })
            .collect()
    }
}

use crate::db::models::{ChannelKind, Notification, NotificationStatus};
use crate::db::store::NotificationStore;
use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

/// Notifications repository over the `notifications` table
#[derive(Clone)]
pub struct NotificationsRepository {
    pool: Arc<PgPool>,
}

impl NotificationsRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> Result<Notification> {
        let channel: String = row.try_get("channel")?;
        let status: String = row.try_get("status")?;

        Ok(Notification {
            id: row.try_get("id")?,
            alarm_id: row.try_get("alarm_id")?,
            recipient_id: row.try_get("recipient_id")?,
            channel: channel.parse::<ChannelKind>()?,
            transition: row.try_get("transition")?,
            severity: row.try_get("severity")?,
            status: status.parse::<NotificationStatus>()?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
            delivered_at: row.try_get("delivered_at")?,
            acknowledged_at: row.try_get("acknowledged_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }
}

#[async_trait]
impl NotificationStore for NotificationsRepository {
    async fn insert(&self, notification: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, alarm_id, recipient_id, channel, transition, severity, status,
                attempts, last_error, created_at, sent_at, delivered_at,
                acknowledged_at, resolved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(notification.id)
        .bind(notification.alarm_id)
        .bind(notification.recipient_id)
        .bind(notification.channel.to_string())
        .bind(&notification.transition)
        .bind(notification.severity)
        .bind(notification.status.to_string())
        .bind(notification.attempts)
        .bind(&notification.last_error)
        .bind(notification.created_at)
        .bind(notification.sent_at)
        .bind(notification.delivered_at)
        .bind(notification.acknowledged_at)
        .bind(notification.resolved_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to insert notification: {}", e)))?;

        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Notification>> {
        let row = sqlx::query(
            r#"
            SELECT id, alarm_id, recipient_id, channel, transition, severity, status,
                   attempts, last_error, created_at, sent_at, delivered_at,
                   acknowledged_at, resolved_at
            FROM notifications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fetch notification: {}", e)))?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn update(&self, notification: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notifications
            SET status = $2, attempts = $3, last_error = $4, sent_at = $5,
                delivered_at = $6, acknowledged_at = $7, resolved_at = $8
            WHERE id = $1
            "#,
        )
        .bind(notification.id)
        .bind(notification.status.to_string())
        .bind(notification.attempts)
        .bind(&notification.last_error)
        .bind(notification.sent_at)
        .bind(notification.delivered_at)
        .bind(notification.acknowledged_at)
        .bind(notification.resolved_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update notification: {}", e)))?;

        Ok(())
    }

    async fn claim_sending(&self, id: Uuid) -> Result<bool> {
        // The status predicate makes the claim a compare-and-set
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'sending'
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to claim notification: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn exists(
        &self,
        alarm_id: Uuid,
        transition: &str,
        recipient_id: Uuid,
        channel: ChannelKind,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS present
            FROM notifications
            WHERE alarm_id = $1 AND transition = $2 AND recipient_id = $3 AND channel = $4
            LIMIT 1
            "#,
        )
        .bind(alarm_id)
        .bind(transition)
        .bind(recipient_id)
        .bind(channel.to_string())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to check notification dedup: {}", e)))?;

        Ok(row.is_some())
    }

    async fn cancel_pending(&self, alarm_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'canceled', resolved_at = NOW()
            WHERE alarm_id = $1 AND status = 'pending'
            "#,
        )
        .bind(alarm_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to cancel notifications: {}", e)))?;

        Ok(result.rows_affected())
    }
}

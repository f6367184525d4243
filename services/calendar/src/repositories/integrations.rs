//! Google integration repository

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::IntegrationRepository;
use crate::models::{GoogleIntegration, WatchChannel};

fn integration_from_row(row: &PgRow) -> GoogleIntegration {
    GoogleIntegration {
        user_id: row.get("user_id"),
        refresh_token: row.get("refresh_token"),
        google_email: row.get("google_email"),
        watch_channel_id: row.get("watch_channel_id"),
        watch_resource_id: row.get("watch_resource_id"),
        watch_expires_at: row.get("watch_expires_at"),
    }
}

/// Google integration repository for database operations
#[derive(Clone)]
pub struct PgIntegrationRepository {
    pool: PgPool,
}

impl PgIntegrationRepository {
    /// Create a new integration repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IntegrationRepository for PgIntegrationRepository {
    async fn find(&self, user_id: Uuid) -> Result<Option<GoogleIntegration>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, refresh_token, google_email, watch_channel_id,
                   watch_resource_id, watch_expires_at
            FROM google_integrations
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(integration_from_row))
    }

    async fn find_by_resource_id(&self, resource_id: &str) -> Result<Option<GoogleIntegration>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, refresh_token, google_email, watch_channel_id,
                   watch_resource_id, watch_expires_at
            FROM google_integrations
            WHERE watch_resource_id = $1
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(integration_from_row))
    }

    async fn find_expiring(&self, before: DateTime<Utc>) -> Result<Vec<GoogleIntegration>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, refresh_token, google_email, watch_channel_id,
                   watch_resource_id, watch_expires_at
            FROM google_integrations
            WHERE watch_expires_at IS NULL OR watch_expires_at < $1
            ORDER BY user_id
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(integration_from_row).collect())
    }

    async fn save_watch(&self, user_id: Uuid, channel: &WatchChannel) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE google_integrations
            SET watch_channel_id = $2,
                watch_resource_id = $3,
                watch_expires_at = $4,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(&channel.channel_id)
        .bind(&channel.resource_id)
        .bind(channel.expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("No Google integration for user {}", user_id));
        }
        Ok(())
    }

    async fn delete(&self, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM google_integrations WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

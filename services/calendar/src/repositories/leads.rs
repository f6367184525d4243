//! Lead repository

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::{LeadRepository, anonymous_contact};
use crate::models::Lead;

fn lead_from_row(row: &PgRow) -> Lead {
    Lead {
        id: row.get("id"),
        user_id: row.get("user_id"),
        contact_whatsapp: row.get("contact_whatsapp"),
        name: row.get("name"),
        email: row.get("email"),
        status: row.get("status"),
    }
}

/// Lead repository for database operations
#[derive(Clone)]
pub struct PgLeadRepository {
    pool: PgPool,
}

impl PgLeadRepository {
    /// Create a new lead repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeadRepository for PgLeadRepository {
    async fn find(&self, id: Uuid) -> Result<Option<Lead>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, contact_whatsapp, name, email, status
            FROM leads
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(lead_from_row))
    }

    async fn find_or_create_by_whatsapp(&self, user_id: Uuid, whatsapp: &str) -> Result<Lead> {
        // The no-op update makes RETURNING yield the existing row on conflict
        let row = sqlx::query(
            r#"
            INSERT INTO leads (user_id, contact_whatsapp)
            VALUES ($1, $2)
            ON CONFLICT (user_id, contact_whatsapp)
            DO UPDATE SET contact_whatsapp = EXCLUDED.contact_whatsapp
            RETURNING id, user_id, contact_whatsapp, name, email, status
            "#,
        )
        .bind(user_id)
        .bind(whatsapp)
        .fetch_one(&self.pool)
        .await?;

        Ok(lead_from_row(&row))
    }

    async fn update_contact(
        &self,
        lead_id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<Lead> {
        let row = sqlx::query(
            r#"
            UPDATE leads
            SET name = COALESCE($2, name),
                email = COALESCE($3, email),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, user_id, contact_whatsapp, name, email, status
            "#,
        )
        .bind(lead_id)
        .bind(name)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(lead_from_row)
            .ok_or_else(|| anyhow!("Lead not found: {}", lead_id))
    }

    async fn create_anonymous(&self, user_id: Uuid, name: Option<&str>) -> Result<Lead> {
        let row = sqlx::query(
            r#"
            INSERT INTO leads (user_id, contact_whatsapp, name)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, contact_whatsapp, name, email, status
            "#,
        )
        .bind(user_id)
        .bind(anonymous_contact())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(lead_from_row(&row))
    }
}

//! Room type repository

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::RoomRepository;
use crate::models::{Privacy, RoomType};

pub(crate) const ROOM_COLUMNS: &str =
    "id, user_id, name, privacy, capacity, total_quantity, daily_rate_cents";

/// Decode a `room_types` row
pub(crate) fn room_from_row(row: &PgRow) -> Result<RoomType, sqlx::Error> {
    let privacy: String = row.try_get("privacy")?;
    let privacy = privacy
        .parse::<Privacy>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;

    Ok(RoomType {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        privacy,
        capacity: row.try_get("capacity")?,
        total_quantity: row.try_get("total_quantity")?,
        daily_rate_cents: row.try_get("daily_rate_cents")?,
    })
}

/// Room type repository for database operations
#[derive(Clone)]
pub struct PgRoomRepository {
    pool: PgPool,
}

impl PgRoomRepository {
    /// Create a new room type repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomRepository for PgRoomRepository {
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<RoomType>> {
        let rows = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM room_types WHERE user_id = $1 ORDER BY name"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let rooms = rows
            .iter()
            .map(room_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rooms)
    }

    async fn find(&self, id: Uuid) -> Result<Option<RoomType>> {
        let row = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM room_types WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(room_from_row(&row)?)),
            None => Ok(None),
        }
    }
}

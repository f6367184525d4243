//! PostgreSQL booking ledger
//!
//! Writes that depend on availability run in a transaction holding a row lock
//! on the room type, so concurrent writers for the same room type queue up
//! behind each other and always count each other's bookings.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    BookingLedger,
    rooms::{ROOM_COLUMNS, room_from_row},
    validate_range,
};
use crate::{
    availability::{stay_price, vacancy},
    error::LedgerError,
    models::{Booking, BookingStatus, ExternalBooking, NewBooking, RoomType},
};

const BOOKING_COLUMNS: &str = "id, user_id, lead_id, room_type_id, check_in_date, check_out_date, \
     total_price_cents, status, payment_reference, external_calendar_event_id, created_at";

fn booking_from_row(row: &PgRow) -> Result<Booking, LedgerError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<BookingStatus>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;

    Ok(Booking {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        lead_id: row.try_get("lead_id")?,
        room_type_id: row.try_get("room_type_id")?,
        check_in_date: row.try_get("check_in_date")?,
        check_out_date: row.try_get("check_out_date")?,
        total_price_cents: row.try_get("total_price_cents")?,
        status,
        payment_reference: row.try_get("payment_reference")?,
        external_calendar_event_id: row.try_get("external_calendar_event_id")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Map a unique-index violation to a ledger conflict
fn conflict_on_duplicate(error: sqlx::Error, event_id: &str) -> LedgerError {
    let duplicate = error
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);

    if duplicate {
        LedgerError::Conflict(format!("calendar event {event_id} already has a live booking"))
    } else {
        LedgerError::Database(error)
    }
}

/// Lock a room type row for the rest of the transaction
async fn lock_room(conn: &mut PgConnection, id: Uuid) -> Result<RoomType, LedgerError> {
    let sql = format!("SELECT {ROOM_COLUMNS} FROM room_types WHERE id = $1 FOR UPDATE");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(LedgerError::RoomTypeNotFound(id))?;

    Ok(room_from_row(&row)?)
}

async fn count_overlapping(
    conn: &mut PgConnection,
    room_type_id: Uuid,
    check_in: NaiveDate,
    check_out: NaiveDate,
    exclude_booking_id: Option<Uuid>,
) -> Result<i64, LedgerError> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM bookings
        WHERE room_type_id = $1
          AND status <> 'cancelled'
          AND check_in_date < $3
          AND check_out_date > $2
          AND ($4::uuid IS NULL OR id <> $4)
        "#,
    )
    .bind(room_type_id)
    .bind(check_in)
    .bind(check_out)
    .bind(exclude_booking_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count)
}

fn ensure_owner(room: &RoomType, user_id: Uuid) -> Result<(), LedgerError> {
    if room.user_id != user_id {
        return Err(LedgerError::Invalid(format!(
            "room type {} does not belong to user {}",
            room.id, user_id
        )));
    }
    Ok(())
}

/// Booking ledger for database operations
#[derive(Clone)]
pub struct PgBookingLedger {
    pool: PgPool,
}

impl PgBookingLedger {
    /// Create a new booking ledger
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        condition: &str,
        value: &str,
    ) -> Result<Option<Booking>, LedgerError> {
        let sql = format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE {condition} \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(booking_from_row).transpose()
    }
}

#[async_trait]
impl BookingLedger for PgBookingLedger {
    async fn check_availability(
        &self,
        room_type_id: Uuid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        exclude_booking_id: Option<Uuid>,
    ) -> Result<i64, LedgerError> {
        validate_range(check_in, check_out)?;

        let mut conn = self.pool.acquire().await?;
        let sql = format!("SELECT {ROOM_COLUMNS} FROM room_types WHERE id = $1");
        let room = match sqlx::query(&sql)
            .bind(room_type_id)
            .fetch_optional(&mut *conn)
            .await?
        {
            Some(row) => room_from_row(&row)?,
            None => return Ok(0),
        };

        let overlapping =
            count_overlapping(&mut conn, room_type_id, check_in, check_out, exclude_booking_id)
                .await?;

        Ok(vacancy(&room, overlapping))
    }

    async fn create_pending(&self, booking: &NewBooking) -> Result<Booking, LedgerError> {
        validate_range(booking.check_in_date, booking.check_out_date)?;

        let mut tx = self.pool.begin().await?;
        let room = lock_room(&mut tx, booking.room_type_id).await?;
        ensure_owner(&room, booking.user_id)?;

        let overlapping = count_overlapping(
            &mut tx,
            room.id,
            booking.check_in_date,
            booking.check_out_date,
            None,
        )
        .await?;
        if vacancy(&room, overlapping) < 1 {
            return Err(LedgerError::NoAvailability {
                room_type_id: room.id,
            });
        }

        let nights = (booking.check_out_date - booking.check_in_date).num_days();
        let total = booking
            .total_price_cents
            .unwrap_or_else(|| stay_price(nights, room.daily_rate_cents));

        let sql = format!(
            r#"
            INSERT INTO bookings (user_id, lead_id, room_type_id, check_in_date, check_out_date,
                                  total_price_cents, status, payment_reference)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7)
            RETURNING {BOOKING_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(booking.user_id)
            .bind(booking.lead_id)
            .bind(booking.room_type_id)
            .bind(booking.check_in_date)
            .bind(booking.check_out_date)
            .bind(total)
            .bind(booking.payment_reference.as_deref())
            .fetch_one(&mut *tx)
            .await?;
        let created = booking_from_row(&row)?;

        tx.commit().await?;

        info!(booking_id = %created.id, room_type_id = %room.id, "Created pending booking");
        Ok(created)
    }

    async fn confirm(
        &self,
        id: Uuid,
        payment_reference: Option<&str>,
    ) -> Result<Booking, LedgerError> {
        let sql = format!(
            r#"
            UPDATE bookings
            SET status = 'confirmed',
                payment_reference = COALESCE($2, payment_reference),
                updated_at = NOW()
            WHERE id = $1 AND status <> 'cancelled'
            RETURNING {BOOKING_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(payment_reference)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => booking_from_row(&row),
            None => match self.find(id).await? {
                Some(_) => Err(LedgerError::Conflict(format!(
                    "booking {id} is cancelled and cannot be confirmed"
                ))),
                None => Err(LedgerError::NotFound(id)),
            },
        }
    }

    async fn attach_event(&self, id: Uuid, event_id: &str) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET external_calendar_event_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_duplicate(e, event_id))?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id));
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<Booking, LedgerError> {
        let sql = format!(
            r#"
            UPDATE bookings
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1
            RETURNING {BOOKING_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::NotFound(id))?;

        booking_from_row(&row)
    }

    async fn cancel_by_external_event(
        &self,
        event_id: &str,
    ) -> Result<Option<Booking>, LedgerError> {
        let sql = format!(
            r#"
            UPDATE bookings
            SET status = 'cancelled', updated_at = NOW()
            WHERE external_calendar_event_id = $1 AND status <> 'cancelled'
            RETURNING {BOOKING_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(booking_from_row).transpose()
    }

    async fn find(&self, id: Uuid) -> Result<Option<Booking>, LedgerError> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(booking_from_row).transpose()
    }

    async fn find_by_external_event(&self, event_id: &str) -> Result<Option<Booking>, LedgerError> {
        self.fetch_one_where(
            "external_calendar_event_id = $1 AND status <> 'cancelled'",
            event_id,
        )
        .await
    }

    async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Booking>, LedgerError> {
        self.fetch_one_where("payment_reference = $1 AND status = 'pending'", reference)
            .await
    }

    async fn upsert_external(
        &self,
        booking: &ExternalBooking,
    ) -> Result<(Booking, bool), LedgerError> {
        validate_range(booking.check_in_date, booking.check_out_date)?;
        let event_id = booking.external_calendar_event_id.as_str();

        let mut tx = self.pool.begin().await?;
        let room = lock_room(&mut tx, booking.room_type_id).await?;
        ensure_owner(&room, booking.user_id)?;

        let existing: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM bookings
            WHERE external_calendar_event_id = $1 AND status <> 'cancelled'
            FOR UPDATE
            "#,
        )
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await?;

        let overlapping = count_overlapping(
            &mut tx,
            room.id,
            booking.check_in_date,
            booking.check_out_date,
            existing,
        )
        .await?;
        if vacancy(&room, overlapping) < 1 {
            return Err(LedgerError::NoAvailability {
                room_type_id: room.id,
            });
        }

        let (row, created) = match existing {
            Some(id) => {
                let sql = format!(
                    r#"
                    UPDATE bookings
                    SET lead_id = $2, room_type_id = $3, check_in_date = $4, check_out_date = $5,
                        total_price_cents = $6, status = $7, updated_at = NOW()
                    WHERE id = $1
                    RETURNING {BOOKING_COLUMNS}
                    "#
                );
                let row = sqlx::query(&sql)
                    .bind(id)
                    .bind(booking.lead_id)
                    .bind(booking.room_type_id)
                    .bind(booking.check_in_date)
                    .bind(booking.check_out_date)
                    .bind(booking.total_price_cents)
                    .bind(booking.status.as_str())
                    .fetch_one(&mut *tx)
                    .await?;
                (row, false)
            }
            None => {
                let sql = format!(
                    r#"
                    INSERT INTO bookings (user_id, lead_id, room_type_id, check_in_date,
                                          check_out_date, total_price_cents, status,
                                          external_calendar_event_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    RETURNING {BOOKING_COLUMNS}
                    "#
                );
                let row = sqlx::query(&sql)
                    .bind(booking.user_id)
                    .bind(booking.lead_id)
                    .bind(booking.room_type_id)
                    .bind(booking.check_in_date)
                    .bind(booking.check_out_date)
                    .bind(booking.total_price_cents)
                    .bind(booking.status.as_str())
                    .bind(event_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| conflict_on_duplicate(e, event_id))?;
                (row, true)
            }
        };
        let stored = booking_from_row(&row)?;

        tx.commit().await?;

        debug!(booking_id = %stored.id, event_id, created, "Upserted calendar booking");
        Ok((stored, created))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::database::{DatabaseConfig, init_pool, run_migrations};

    async fn seed(pool: &PgPool) -> Result<(Uuid, Uuid, Uuid), Box<dyn std::error::Error>> {
        let user_id = Uuid::new_v4();
        let room_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO room_types (user_id, name, privacy, capacity, total_quantity, daily_rate_cents)
            VALUES ($1, 'Ocean View', 'private', 2, 2, 25000)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .fetch_one(pool)
        .await?;
        let lead_id: Uuid = sqlx::query_scalar(
            "INSERT INTO leads (user_id, contact_whatsapp) VALUES ($1, $2) RETURNING id",
        )
        .bind(user_id)
        .bind(format!("55119{}", &Uuid::new_v4().simple().to_string()[..8]))
        .fetch_one(pool)
        .await?;

        Ok((user_id, room_id, lead_id))
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn test_ocean_view_inventory_runs_out() -> Result<(), Box<dyn std::error::Error>> {
        let pool = init_pool(&DatabaseConfig::from_env()?).await?;
        run_migrations(&pool).await?;
        let ledger = PgBookingLedger::new(pool.clone());
        let (user_id, room_id, lead_id) = seed(&pool).await?;

        let check_in: NaiveDate = "2025-06-01".parse()?;
        let check_out: NaiveDate = "2025-06-03".parse()?;
        let request = NewBooking {
            user_id,
            lead_id,
            room_type_id: room_id,
            check_in_date: check_in,
            check_out_date: check_out,
            total_price_cents: None,
            payment_reference: None,
        };

        assert_eq!(ledger.check_availability(room_id, check_in, check_out, None).await?, 2);
        let first = ledger.create_pending(&request).await?;
        assert_eq!(first.total_price_cents, 50_000);
        assert_eq!(ledger.check_availability(room_id, check_in, check_out, None).await?, 1);
        ledger.create_pending(&request).await?;
        assert_eq!(ledger.check_availability(room_id, check_in, check_out, None).await?, 0);

        assert!(matches!(
            ledger.create_pending(&request).await,
            Err(LedgerError::NoAvailability { .. })
        ));

        Ok(())
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL instance"]
    async fn test_upsert_external_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let pool = init_pool(&DatabaseConfig::from_env()?).await?;
        run_migrations(&pool).await?;
        let ledger = PgBookingLedger::new(pool.clone());
        let (user_id, room_id, lead_id) = seed(&pool).await?;

        let booking = ExternalBooking {
            user_id,
            lead_id,
            room_type_id: room_id,
            check_in_date: "2025-07-01".parse()?,
            check_out_date: "2025-07-04".parse()?,
            total_price_cents: 75_000,
            status: BookingStatus::Confirmed,
            external_calendar_event_id: format!("evt-{}", Uuid::new_v4()),
        };

        let (first, created) = ledger.upsert_external(&booking).await?;
        assert!(created);
        let (second, created) = ledger.upsert_external(&booking).await?;
        assert!(!created);
        assert_eq!(first.id, second.id);

        let cancelled = ledger
            .cancel_by_external_event(&booking.external_calendar_event_id)
            .await?;
        assert_eq!(cancelled.map(|b| b.status), Some(BookingStatus::Cancelled));
        assert!(
            ledger
                .cancel_by_external_event(&booking.external_calendar_event_id)
                .await?
                .is_none()
        );

        Ok(())
    }
}

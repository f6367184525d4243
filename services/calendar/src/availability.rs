//! Inventory arithmetic shared by every ledger implementation

use chrono::{Days, NaiveDate};

use crate::models::{Privacy, RoomType};

/// Units a room type can hold at once
///
/// Private rooms are booked whole, so a unit is a room. Shared rooms are
/// booked per bed, so a unit is one of `capacity` beds in each room.
pub fn total_units(room: &RoomType) -> i64 {
    let quantity = i64::from(room.total_quantity.max(0));
    match room.privacy {
        Privacy::Private => quantity,
        Privacy::Shared => quantity * i64::from(room.capacity.max(0)),
    }
}

/// Free units given the number of overlapping live bookings, never negative
pub fn vacancy(room: &RoomType, overlapping: i64) -> i64 {
    (total_units(room) - overlapping).max(0)
}

/// Nights times the daily rate, zero when either is not positive
pub fn stay_price(nights: i64, daily_rate_cents: i64) -> i64 {
    if nights <= 0 || daily_rate_cents <= 0 {
        return 0;
    }
    nights.saturating_mul(daily_rate_cents)
}

/// Dates of a stay derived from a calendar event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stay {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub nights: i64,
}

impl Stay {
    /// Derive a stay from event bounds
    ///
    /// All-day events carry an exclusive end date, so the checkout is the day
    /// before it. Timed events check out on their end date. Returns `None`
    /// when the event does not span a night.
    pub fn from_event(start: NaiveDate, end: NaiveDate, all_day: bool) -> Option<Self> {
        let check_out = if all_day {
            end.checked_sub_days(Days::new(1))?
        } else {
            end
        };

        let nights = (check_out - start).num_days();
        if nights <= 0 {
            return None;
        }

        Some(Self {
            check_in: start,
            check_out,
            nights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn room(privacy: Privacy, capacity: i32, total_quantity: i32) -> RoomType {
        RoomType {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Ocean View".to_string(),
            privacy,
            capacity,
            total_quantity,
            daily_rate_cents: 25_000,
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_private_rooms_count_rooms() {
        let ocean_view = room(Privacy::Private, 4, 2);
        assert_eq!(vacancy(&ocean_view, 0), 2);
        assert_eq!(vacancy(&ocean_view, 1), 1);
        assert_eq!(vacancy(&ocean_view, 3), 0);
    }

    #[test]
    fn test_shared_rooms_count_beds() {
        let dorm = room(Privacy::Shared, 6, 2);
        assert_eq!(total_units(&dorm), 12);
        assert_eq!(vacancy(&dorm, 5), 7);
    }

    #[test]
    fn test_stay_price_floors_at_zero() {
        assert_eq!(stay_price(3, 25_000), 75_000);
        assert_eq!(stay_price(0, 25_000), 0);
        assert_eq!(stay_price(2, -1), 0);
    }

    #[test]
    fn test_all_day_event_end_is_exclusive() {
        let stay = Stay::from_event(date("2025-06-01"), date("2025-06-04"), true).unwrap();
        assert_eq!(stay.check_out, date("2025-06-03"));
        assert_eq!(stay.nights, 2);

        assert_eq!(Stay::from_event(date("2025-06-01"), date("2025-06-02"), true), None);
    }

    #[test]
    fn test_timed_event_checks_out_on_end_date() {
        let stay = Stay::from_event(date("2025-06-01"), date("2025-06-04"), false).unwrap();
        assert_eq!(stay.check_out, date("2025-06-04"));
        assert_eq!(stay.nights, 3);

        assert_eq!(Stay::from_event(date("2025-06-01"), date("2025-06-01"), false), None);
    }
}

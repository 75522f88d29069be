use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::domain::{Booking, Car, NewBooking, NewIntent, OutboxIntent};
use crate::error::BookingError;
use crate::schema::{bookings, cars, outbox_events};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = cars)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CarRow {
    pub id: i64,
    pub version: i64,
    pub company_id: i64,
    pub model_id: i64,
    pub current_location_id: Option<i64>,
    pub status: String,
    pub plate_number: String,
    pub mileage_km: i32,
    pub daily_price_cents: i64,
    pub deleted: bool,
}

impl TryFrom<CarRow> for Car {
    type Error = BookingError;

    fn try_from(row: CarRow) -> Result<Self, Self::Error> {
        Ok(Car {
            id: row.id,
            version: row.version,
            company_id: row.company_id,
            model_id: row.model_id,
            current_location_id: row.current_location_id,
            status: row.status.parse()?,
            plate_number: row.plate_number,
            mileage_km: row.mileage_km,
            daily_price_cents: row.daily_price_cents,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = bookings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BookingRow {
    pub id: i64,
    pub version: i64,
    pub client_id: i64,
    pub car_id: i64,
    pub pickup_location_id: i64,
    pub return_location_id: i64,
    pub pickup_time: DateTime<Utc>,
    pub return_time: DateTime<Utc>,
    pub status: String,
    pub total_price_cents: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = BookingError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            version: row.version,
            client_id: row.client_id,
            car_id: row.car_id,
            pickup_location_id: row.pickup_location_id,
            return_location_id: row.return_location_id,
            pickup_time: row.pickup_time,
            return_time: row.return_time,
            status: row.status.parse()?,
            total_price_cents: row.total_price_cents,
            currency: row.currency,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = bookings)]
pub struct NewBookingRow {
    pub client_id: i64,
    pub car_id: i64,
    pub pickup_location_id: i64,
    pub return_location_id: i64,
    pub pickup_time: DateTime<Utc>,
    pub return_time: DateTime<Utc>,
    pub status: String,
    pub total_price_cents: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewBookingRow {
    pub fn created(booking: &NewBooking, now: DateTime<Utc>) -> Self {
        Self {
            client_id: booking.client_id,
            car_id: booking.car_id,
            pickup_location_id: booking.pickup_location_id,
            return_location_id: booking.return_location_id,
            pickup_time: booking.window.pickup(),
            return_time: booking.window.return_time(),
            status: crate::domain::BookingStatus::Created.as_str().to_string(),
            total_price_cents: booking.total_price_cents,
            currency: booking.currency.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, QueryableByName)]
#[diesel(table_name = outbox_events)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OutboxRow {
    pub id: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxIntent {
    type Error = BookingError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxIntent {
            id: row.id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.event_data,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            error_message: row.error_message,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = outbox_events)]
pub struct NewOutboxRow {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

impl NewOutboxRow {
    pub fn pending(intent: NewIntent, now: DateTime<Utc>) -> Self {
        Self {
            aggregate_type: intent.aggregate_type,
            aggregate_id: intent.aggregate_id,
            event_type: intent.event_type.as_str().to_string(),
            event_data: intent.payload,
            status: crate::domain::OutboxStatus::Pending.as_str().to_string(),
            retry_count: 0,
            created_at: now,
        }
    }
}

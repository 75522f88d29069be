use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{IntentType, UnknownIntentType, BOOKING_AGGREGATE};
use std::fmt;
use std::str::FromStr;

use crate::error::BookingError;

pub type BookingId = i64;
pub type CarId = i64;
pub type ClientId = i64;
pub type CompanyId = i64;
pub type LocationId = i64;
pub type ModelId = i64;
pub type IntentId = i64;

#[derive(Debug, Clone, Copy)]
struct StatusTraits {
    active: bool,
    blocks_inventory: bool,
    terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Created,
    Pending,
    Confirmed,
    Canceled,
    Completed,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 5] = [
        BookingStatus::Created,
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Canceled,
        BookingStatus::Completed,
    ];

    const fn traits(self) -> StatusTraits {
        match self {
            BookingStatus::Created | BookingStatus::Pending | BookingStatus::Confirmed => {
                StatusTraits {
                    active: true,
                    blocks_inventory: true,
                    terminal: false,
                }
            }
            BookingStatus::Canceled | BookingStatus::Completed => StatusTraits {
                active: false,
                blocks_inventory: false,
                terminal: true,
            },
        }
    }

    pub const fn is_active(self) -> bool {
        self.traits().active
    }

    pub const fn blocks_inventory(self) -> bool {
        self.traits().blocks_inventory
    }

    pub const fn is_terminal(self) -> bool {
        self.traits().terminal
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Created => "CREATED",
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Canceled => "CANCELED",
            BookingStatus::Completed => "COMPLETED",
        }
    }

    /// Column values of every status that counts against a car's availability.
    pub fn blocking_names() -> Vec<&'static str> {
        Self::ALL
            .into_iter()
            .filter(|status| status.blocks_inventory())
            .map(BookingStatus::as_str)
            .collect()
    }

    pub fn active_names() -> Vec<&'static str> {
        Self::ALL
            .into_iter()
            .filter(|status| status.is_active())
            .map(BookingStatus::as_str)
            .collect()
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BookingError::storage(format!("unknown booking status {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CarStatus {
    Available,
    Maintenance,
    OutOfService,
}

impl CarStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CarStatus::Available => "AVAILABLE",
            CarStatus::Maintenance => "MAINTENANCE",
            CarStatus::OutOfService => "OUT_OF_SERVICE",
        }
    }

    pub fn is_rentable(self) -> bool {
        matches!(self, CarStatus::Available)
    }
}

impl FromStr for CarStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(CarStatus::Available),
            "MAINTENANCE" => Ok(CarStatus::Maintenance),
            "OUT_OF_SERVICE" => Ok(CarStatus::OutOfService),
            other => Err(BookingError::storage(format!("unknown car status {other}"))),
        }
    }
}

/// Half-open rental period `[pickup, return_time)`.
///
/// Construction enforces `pickup < return_time`, so every window in the
/// system is non-empty and back-to-back windows never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RentalWindow {
    pickup: DateTime<Utc>,
    return_time: DateTime<Utc>,
}

impl RentalWindow {
    pub fn new(pickup: DateTime<Utc>, return_time: DateTime<Utc>) -> Result<Self, BookingError> {
        if return_time <= pickup {
            return Err(BookingError::business_rule(
                "Return date must be after pickup date",
            ));
        }
        Ok(Self {
            pickup,
            return_time,
        })
    }

    pub fn pickup(&self) -> DateTime<Utc> {
        self.pickup
    }

    pub fn return_time(&self) -> DateTime<Utc> {
        self.return_time
    }

    pub fn overlaps(&self, other: &RentalWindow) -> bool {
        self.pickup < other.return_time && other.pickup < self.return_time
    }

    /// Whole rental days between pickup and return; a partial day is not
    /// billed. Windows shorter than one day cannot be priced.
    pub fn billable_days(&self) -> Result<i64, BookingError> {
        let days = (self.return_time - self.pickup).num_days();
        if days <= 0 {
            return Err(BookingError::business_rule(
                "Return date must be after pickup date",
            ));
        }
        Ok(days)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Car {
    pub id: CarId,
    pub version: i64,
    pub company_id: CompanyId,
    pub model_id: ModelId,
    pub current_location_id: Option<LocationId>,
    pub status: CarStatus,
    pub plate_number: String,
    pub mileage_km: i32,
    pub daily_price_cents: i64,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: BookingId,
    pub version: i64,
    pub client_id: ClientId,
    pub car_id: CarId,
    pub pickup_location_id: LocationId,
    pub return_location_id: LocationId,
    pub pickup_time: DateTime<Utc>,
    pub return_time: DateTime<Utc>,
    pub status: BookingStatus,
    pub total_price_cents: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn window(&self) -> RentalWindow {
        RentalWindow {
            pickup: self.pickup_time,
            return_time: self.return_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub client_id: ClientId,
    pub car_id: CarId,
    pub pickup_location_id: LocationId,
    pub return_location_id: LocationId,
    pub window: RentalWindow,
    pub total_price_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateQuery {
    pub model_id: ModelId,
    pub location_id: LocationId,
    pub window: RentalWindow,
    pub limit: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Completed => "COMPLETED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "COMPLETED" => Ok(OutboxStatus::Completed),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(BookingError::storage(format!("unknown outbox status {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxIntent {
    pub id: IntentId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxIntent {
    pub fn intent_type(&self) -> Result<IntentType, UnknownIntentType> {
        self.event_type.parse()
    }

    /// True once the retry sweep will no longer pick the intent up.
    pub fn is_dead_letter(&self, max_retries: i32) -> bool {
        self.status == OutboxStatus::Failed && self.retry_count >= max_retries
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIntent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: IntentType,
    pub payload: serde_json::Value,
}

impl NewIntent {
    pub fn for_booking<P: Serialize>(
        booking_id: BookingId,
        event_type: IntentType,
        payload: &P,
    ) -> Result<Self, BookingError> {
        Ok(Self {
            aggregate_type: BOOKING_AGGREGATE.to_string(),
            aggregate_id: booking_id.to_string(),
            event_type,
            payload: serde_json::to_value(payload)?,
        })
    }
}

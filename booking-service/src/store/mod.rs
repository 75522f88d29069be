//! Storage ports of the booking core.
//!
//! Everything that must observe a car lock goes through [`StoreTx`], which can
//! only be obtained inside [`BookingStore::in_transaction`]. Reads that are
//! advisory, projections and the outbox bookkeeping live on the store itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::domain::{
    Booking, BookingId, BookingStatus, CandidateQuery, Car, CarId, ClientId, CompanyId, IntentId,
    LocationId, NewBooking, NewIntent, OutboxIntent, RentalWindow,
};
use crate::error::BookingError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Unit of work handed to [`BookingStore::in_transaction`].
pub type TxResult<'t, T> = BoxFuture<'t, Result<T, BookingError>>;

/// Operations available while a transaction is open.
#[async_trait]
pub trait StoreTx: Send {
    /// Takes the exclusive row lock on a car, waiting at most the configured
    /// lock timeout. Fails with `LockContended` when the wait runs out and
    /// `NotFound` for missing or soft-deleted cars.
    async fn lock_car_for_update(&mut self, car_id: CarId) -> Result<Car, BookingError>;

    /// Gives a lock back before the transaction ends.
    async fn release_car_lock(&mut self, car_id: CarId) -> Result<(), BookingError>;

    async fn has_blocking_overlap(
        &mut self,
        car_id: CarId,
        window: &RentalWindow,
    ) -> Result<bool, BookingError>;

    async fn client_exists(&mut self, client_id: ClientId) -> Result<bool, BookingError>;

    async fn location_exists(&mut self, location_id: LocationId) -> Result<bool, BookingError>;

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<Booking, BookingError>;

    async fn find_booking(&mut self, id: BookingId) -> Result<Option<Booking>, BookingError>;

    /// Compare-and-swap on the booking's version; bumps it by one.
    async fn update_booking_status(
        &mut self,
        id: BookingId,
        expected_version: i64,
        status: BookingStatus,
    ) -> Result<Booking, BookingError>;

    async fn append_intent(&mut self, intent: NewIntent) -> Result<IntentId, BookingError>;
}

#[async_trait]
pub trait BookingStore: Clone + Send + Sync + 'static {
    /// Runs `work` in one transaction. `Ok` commits, `Err` rolls back and
    /// releases every lock taken inside.
    async fn in_transaction<T, F>(&self, work: F) -> Result<T, BookingError>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut dyn StoreTx) -> TxResult<'t, T> + Send + 'static;

    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, BookingError>;

    /// Rentable cars of a model at a location with no blocking booking in the
    /// window, ordered by id.
    async fn find_free_cars(&self, query: &CandidateQuery) -> Result<Vec<CarId>, BookingError>;

    async fn active_bookings_for_company(
        &self,
        company_id: CompanyId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BookingError>;

    async fn active_bookings_for_location(
        &self,
        location_id: LocationId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BookingError>;

    async fn bookings_for_location_in_period(
        &self,
        location_id: LocationId,
        window: &RentalWindow,
    ) -> Result<Vec<Booking>, BookingError>;

    /// Oldest-first `PENDING` intents whose aggregate has nothing older still
    /// outstanding.
    async fn fetch_pending_intents(&self, limit: i64) -> Result<Vec<OutboxIntent>, BookingError>;

    /// `PENDING -> PROCESSING`. Returns false when another relay won the race.
    async fn mark_intent_processing(
        &self,
        id: IntentId,
        now: DateTime<Utc>,
    ) -> Result<bool, BookingError>;

    async fn mark_intent_completed(
        &self,
        id: IntentId,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError>;

    async fn mark_intent_failed(&self, id: IntentId, message: &str) -> Result<(), BookingError>;

    /// `FAILED -> PENDING` for intents still under the retry budget.
    async fn requeue_failed_intents(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<usize, BookingError>;

    /// `PROCESSING -> FAILED` for claims older than `cutoff`.
    async fn reclaim_stale_intents(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<usize, BookingError>;

    async fn dead_letter_intents(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<OutboxIntent>, BookingError>;
}

pub const PROCESSING_LEASE_EXPIRED: &str = "processing lease expired";

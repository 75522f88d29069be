//! In-process store backing `--store memory` and the test suite.
//!
//! Transactions stage their writes and apply them atomically on commit after
//! re-checking the versions they were based on. Car locks are per-car async
//! mutexes acquired with the same bounded wait as the database lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::{BookingStore, StoreTx, TxResult, PROCESSING_LEASE_EXPIRED};
use crate::domain::{
    Booking, BookingId, BookingStatus, CandidateQuery, Car, CarId, CarStatus, ClientId, CompanyId,
    IntentId, LocationId, ModelId, NewBooking, NewIntent, OutboxIntent, OutboxStatus,
    RentalWindow,
};
use crate::error::BookingError;

#[derive(Debug, Clone)]
struct Company {
    deleted: bool,
}

#[derive(Debug, Clone)]
struct Location {
    company_id: CompanyId,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct Client {
    deleted: bool,
}

#[derive(Debug, Default)]
struct State {
    companies: HashMap<CompanyId, Company>,
    locations: HashMap<LocationId, Location>,
    clients: HashMap<ClientId, Client>,
    cars: BTreeMap<CarId, Car>,
    bookings: BTreeMap<BookingId, Booking>,
    intents: BTreeMap<IntentId, OutboxIntent>,
}

impl State {
    fn location_is_live(&self, location_id: LocationId) -> bool {
        self.locations
            .get(&location_id)
            .map(|location| !location.deleted)
            .unwrap_or(false)
    }

    fn company_is_live(&self, company_id: CompanyId) -> bool {
        self.companies
            .get(&company_id)
            .map(|company| !company.deleted)
            .unwrap_or(false)
    }

    fn sorted_by_pickup(mut bookings: Vec<Booking>) -> Vec<Booking> {
        bookings.sort_by_key(|booking| (booking.pickup_time, booking.id));
        bookings
    }

    fn intents_in_order(&self) -> Vec<&OutboxIntent> {
        let mut intents: Vec<&OutboxIntent> = self.intents.values().collect();
        intents.sort_by_key(|intent| (intent.created_at, intent.id));
        intents
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    car_locks: Mutex<HashMap<CarId, Arc<tokio::sync::Mutex<()>>>>,
    lock_timeout: Duration,
    seeds: AtomicI64,
    booking_seq: AtomicI64,
    intent_seq: AtomicI64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn car_lock(&self, car_id: CarId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .car_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(car_id).or_default().clone()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

/// Car to register in a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct CarSeed {
    pub company_id: CompanyId,
    pub model_id: ModelId,
    pub location_id: LocationId,
    pub plate_number: String,
    pub daily_price_cents: i64,
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                car_locks: Mutex::new(HashMap::new()),
                lock_timeout,
                seeds: AtomicI64::new(1),
                booking_seq: AtomicI64::new(1),
                intent_seq: AtomicI64::new(1),
            }),
        }
    }

    /// Store preloaded with one company, two locations, two clients and a
    /// handful of cars across two models.
    pub fn with_demo_fleet(lock_timeout: Duration) -> Self {
        let store = Self::new(lock_timeout);
        let company = store.add_company();
        let downtown = store.add_location(company);
        let airport = store.add_location(company);
        store.add_client();
        store.add_client();

        let fleet = [
            (1, downtown, "RNT-1001", 4_500),
            (1, downtown, "RNT-1002", 4_500),
            (1, airport, "RNT-1003", 4_900),
            (2, downtown, "RNT-2001", 7_900),
            (2, airport, "RNT-2002", 7_900),
        ];
        for (model_id, location_id, plate, price) in fleet {
            store.add_car(CarSeed {
                company_id: company,
                model_id,
                location_id,
                plate_number: plate.to_string(),
                daily_price_cents: price,
            });
        }
        store
    }

    fn next_seed(&self) -> i64 {
        self.inner.seeds.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add_company(&self) -> CompanyId {
        let id = self.next_seed();
        self.inner
            .state()
            .companies
            .insert(id, Company { deleted: false });
        id
    }

    pub fn add_location(&self, company_id: CompanyId) -> LocationId {
        let id = self.next_seed();
        self.inner.state().locations.insert(
            id,
            Location {
                company_id,
                deleted: false,
            },
        );
        id
    }

    pub fn add_client(&self) -> ClientId {
        let id = self.next_seed();
        self.inner
            .state()
            .clients
            .insert(id, Client { deleted: false });
        id
    }

    pub fn add_car(&self, seed: CarSeed) -> CarId {
        let id = self.next_seed();
        self.inner.state().cars.insert(
            id,
            Car {
                id,
                version: 0,
                company_id: seed.company_id,
                model_id: seed.model_id,
                current_location_id: Some(seed.location_id),
                status: CarStatus::Available,
                plate_number: seed.plate_number,
                mileage_km: 0,
                daily_price_cents: seed.daily_price_cents,
                deleted: false,
            },
        );
        id
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn set_car_status(&self, car_id: CarId, status: CarStatus) {
        if let Some(car) = self.inner.state().cars.get_mut(&car_id) {
            car.status = status;
            car.version += 1;
        }
    }

    pub fn soft_delete_car(&self, car_id: CarId) {
        if let Some(car) = self.inner.state().cars.get_mut(&car_id) {
            car.deleted = true;
        }
    }

    pub fn soft_delete_location(&self, location_id: LocationId) {
        if let Some(location) = self.inner.state().locations.get_mut(&location_id) {
            location.deleted = true;
        }
    }

    /// Holds a car's lock the way a concurrent transaction would.
    pub async fn hold_car_lock(&self, car_id: CarId) -> OwnedMutexGuard<()> {
        self.inner.car_lock(car_id).lock_owned().await
    }

    pub fn intents(&self) -> Vec<OutboxIntent> {
        self.inner
            .state()
            .intents_in_order()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn bookings(&self) -> Vec<Booking> {
        self.inner.state().bookings.values().cloned().collect()
    }

    /// Writes a booking straight into committed state, bypassing the claim.
    pub fn force_booking(&self, booking: Booking) {
        self.inner.booking_seq.fetch_max(booking.id + 1, Ordering::SeqCst);
        self.inner.state().bookings.insert(booking.id, booking);
    }
}

#[derive(Debug)]
struct StagedBooking {
    base_version: Option<i64>,
    booking: Booking,
}

/// Open transaction over a [`MemoryStore`].
struct MemoryTx {
    inner: Arc<Inner>,
    guards: HashMap<CarId, OwnedMutexGuard<()>>,
    bookings: BTreeMap<BookingId, StagedBooking>,
    intents: Vec<OutboxIntent>,
}

impl MemoryTx {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            guards: HashMap::new(),
            bookings: BTreeMap::new(),
            intents: Vec::new(),
        }
    }

    fn live_car(&self, car_id: CarId) -> Option<Car> {
        self.inner
            .state()
            .cars
            .get(&car_id)
            .filter(|car| !car.deleted)
            .cloned()
    }

    fn visible_booking(&self, id: BookingId) -> Option<Booking> {
        if let Some(staged) = self.bookings.get(&id) {
            return Some(staged.booking.clone());
        }
        self.inner.state().bookings.get(&id).cloned()
    }

    fn commit(self) -> Result<(), BookingError> {
        let mut state = self.inner.state();
        for (id, staged) in &self.bookings {
            if let Some(base) = staged.base_version {
                let current = state.bookings.get(id).map(|booking| booking.version);
                if current != Some(base) {
                    return Err(BookingError::ConcurrencyConflict {
                        entity: "Booking",
                        id: *id,
                    });
                }
            }
        }
        for (id, staged) in self.bookings {
            state.bookings.insert(id, staged.booking);
        }
        for intent in self.intents {
            state.intents.insert(intent.id, intent);
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_car_for_update(&mut self, car_id: CarId) -> Result<Car, BookingError> {
        if self.guards.contains_key(&car_id) {
            return self
                .live_car(car_id)
                .ok_or_else(|| BookingError::not_found("Car", car_id));
        }
        if self.live_car(car_id).is_none() {
            return Err(BookingError::not_found("Car", car_id));
        }

        let lock = self.inner.car_lock(car_id);
        let guard = tokio::time::timeout(self.inner.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| BookingError::LockContended { car_id })?;

        let car = self
            .live_car(car_id)
            .ok_or_else(|| BookingError::not_found("Car", car_id))?;
        self.guards.insert(car_id, guard);
        Ok(car)
    }

    async fn release_car_lock(&mut self, car_id: CarId) -> Result<(), BookingError> {
        self.guards.remove(&car_id);
        Ok(())
    }

    async fn has_blocking_overlap(
        &mut self,
        car_id: CarId,
        window: &RentalWindow,
    ) -> Result<bool, BookingError> {
        let blocks = |booking: &Booking| {
            booking.car_id == car_id
                && booking.status.blocks_inventory()
                && booking.window().overlaps(window)
        };
        if self
            .bookings
            .values()
            .any(|staged| blocks(&staged.booking))
        {
            return Ok(true);
        }
        let state = self.inner.state();
        Ok(state
            .bookings
            .values()
            .filter(|booking| !self.bookings.contains_key(&booking.id))
            .any(blocks))
    }

    async fn client_exists(&mut self, client_id: ClientId) -> Result<bool, BookingError> {
        Ok(self
            .inner
            .state()
            .clients
            .get(&client_id)
            .map(|client| !client.deleted)
            .unwrap_or(false))
    }

    async fn location_exists(&mut self, location_id: LocationId) -> Result<bool, BookingError> {
        Ok(self.inner.state().location_is_live(location_id))
    }

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<Booking, BookingError> {
        let now = Utc::now();
        let id = self.inner.booking_seq.fetch_add(1, Ordering::SeqCst);
        let created = Booking {
            id,
            version: 0,
            client_id: booking.client_id,
            car_id: booking.car_id,
            pickup_location_id: booking.pickup_location_id,
            return_location_id: booking.return_location_id,
            pickup_time: booking.window.pickup(),
            return_time: booking.window.return_time(),
            status: BookingStatus::Created,
            total_price_cents: booking.total_price_cents,
            currency: booking.currency.clone(),
            created_at: now,
            updated_at: now,
        };
        self.bookings.insert(
            id,
            StagedBooking {
                base_version: None,
                booking: created.clone(),
            },
        );
        Ok(created)
    }

    async fn find_booking(&mut self, id: BookingId) -> Result<Option<Booking>, BookingError> {
        Ok(self.visible_booking(id))
    }

    async fn update_booking_status(
        &mut self,
        id: BookingId,
        expected_version: i64,
        status: BookingStatus,
    ) -> Result<Booking, BookingError> {
        let current = self
            .visible_booking(id)
            .ok_or_else(|| BookingError::not_found("Booking", id))?;
        if current.version != expected_version {
            return Err(BookingError::ConcurrencyConflict {
                entity: "Booking",
                id,
            });
        }

        let base_version = match self.bookings.get(&id) {
            Some(staged) => staged.base_version,
            None => Some(current.version),
        };
        let updated = Booking {
            status,
            version: current.version + 1,
            updated_at: Utc::now(),
            ..current
        };
        self.bookings.insert(
            id,
            StagedBooking {
                base_version,
                booking: updated.clone(),
            },
        );
        Ok(updated)
    }

    async fn append_intent(&mut self, intent: NewIntent) -> Result<IntentId, BookingError> {
        let id = self.inner.intent_seq.fetch_add(1, Ordering::SeqCst);
        self.intents.push(OutboxIntent {
            id,
            aggregate_type: intent.aggregate_type,
            aggregate_id: intent.aggregate_id,
            event_type: intent.event_type.as_str().to_string(),
            payload: intent.payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            claimed_at: None,
            processed_at: None,
        });
        Ok(id)
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn in_transaction<T, F>(&self, work: F) -> Result<T, BookingError>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut dyn StoreTx) -> TxResult<'t, T> + Send + 'static,
    {
        let mut tx = MemoryTx::new(self.inner.clone());
        let value = work(&mut tx as &mut dyn StoreTx).await?;
        tx.commit()?;
        Ok(value)
    }

    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, BookingError> {
        Ok(self.inner.state().bookings.get(&id).cloned())
    }

    async fn find_free_cars(&self, query: &CandidateQuery) -> Result<Vec<CarId>, BookingError> {
        let state = self.inner.state();
        let limit = usize::try_from(query.limit).unwrap_or(0);
        let free = state
            .cars
            .values()
            .filter(|car| {
                !car.deleted
                    && car.status.is_rentable()
                    && car.model_id == query.model_id
                    && car.current_location_id == Some(query.location_id)
                    && state.location_is_live(query.location_id)
                    && state.company_is_live(car.company_id)
            })
            .filter(|car| {
                !state.bookings.values().any(|booking| {
                    booking.car_id == car.id
                        && booking.status.blocks_inventory()
                        && booking.window().overlaps(&query.window)
                })
            })
            .map(|car| car.id)
            .take(limit)
            .collect();
        Ok(free)
    }

    async fn active_bookings_for_company(
        &self,
        company_id: CompanyId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BookingError> {
        let state = self.inner.state();
        let bookings = state
            .bookings
            .values()
            .filter(|booking| booking.status.is_active() && booking.return_time >= now)
            .filter(|booking| {
                state
                    .cars
                    .get(&booking.car_id)
                    .map(|car| car.company_id == company_id)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(State::sorted_by_pickup(bookings))
    }

    async fn active_bookings_for_location(
        &self,
        location_id: LocationId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BookingError> {
        let state = self.inner.state();
        let bookings = state
            .bookings
            .values()
            .filter(|booking| booking.status.is_active() && booking.return_time >= now)
            .filter(|booking| {
                booking.pickup_location_id == location_id
                    || booking.return_location_id == location_id
            })
            .cloned()
            .collect();
        Ok(State::sorted_by_pickup(bookings))
    }

    async fn bookings_for_location_in_period(
        &self,
        location_id: LocationId,
        window: &RentalWindow,
    ) -> Result<Vec<Booking>, BookingError> {
        let state = self.inner.state();
        let bookings = state
            .bookings
            .values()
            .filter(|booking| {
                booking.pickup_location_id == location_id
                    || booking.return_location_id == location_id
            })
            .filter(|booking| booking.window().overlaps(window))
            .cloned()
            .collect();
        Ok(State::sorted_by_pickup(bookings))
    }

    async fn fetch_pending_intents(&self, limit: i64) -> Result<Vec<OutboxIntent>, BookingError> {
        let state = self.inner.state();
        let ordered = state.intents_in_order();
        let limit = usize::try_from(limit).unwrap_or(0);

        let mut eligible = Vec::new();
        for (position, intent) in ordered.iter().enumerate() {
            if eligible.len() >= limit {
                break;
            }
            if intent.status != OutboxStatus::Pending {
                continue;
            }
            let blocked = ordered[..position].iter().any(|older| {
                older.aggregate_type == intent.aggregate_type
                    && older.aggregate_id == intent.aggregate_id
                    && older.status != OutboxStatus::Completed
            });
            if blocked {
                debug!(intent_id = intent.id, "intent waits behind an older one");
                continue;
            }
            eligible.push((*intent).clone());
        }
        Ok(eligible)
    }

    async fn mark_intent_processing(
        &self,
        id: IntentId,
        now: DateTime<Utc>,
    ) -> Result<bool, BookingError> {
        let mut state = self.inner.state();
        let intent = state
            .intents
            .get_mut(&id)
            .ok_or_else(|| BookingError::not_found("OutboxIntent", id))?;
        if intent.status != OutboxStatus::Pending {
            return Ok(false);
        }
        intent.status = OutboxStatus::Processing;
        intent.claimed_at = Some(now);
        Ok(true)
    }

    async fn mark_intent_completed(
        &self,
        id: IntentId,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        let mut state = self.inner.state();
        let intent = state
            .intents
            .get_mut(&id)
            .ok_or_else(|| BookingError::not_found("OutboxIntent", id))?;
        intent.status = OutboxStatus::Completed;
        intent.processed_at = Some(now);
        intent.error_message = None;
        Ok(())
    }

    async fn mark_intent_failed(&self, id: IntentId, message: &str) -> Result<(), BookingError> {
        let mut state = self.inner.state();
        let intent = state
            .intents
            .get_mut(&id)
            .ok_or_else(|| BookingError::not_found("OutboxIntent", id))?;
        intent.status = OutboxStatus::Failed;
        intent.retry_count += 1;
        intent.error_message = Some(message.to_string());
        Ok(())
    }

    async fn requeue_failed_intents(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<usize, BookingError> {
        let mut state = self.inner.state();
        let ids: Vec<IntentId> = state
            .intents_in_order()
            .into_iter()
            .filter(|intent| intent.status == OutboxStatus::Failed)
            .filter(|intent| intent.retry_count < max_retries)
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|intent| intent.id)
            .collect();

        for id in &ids {
            if let Some(intent) = state.intents.get_mut(id) {
                intent.status = OutboxStatus::Pending;
                intent.error_message = None;
                intent.claimed_at = None;
            }
        }
        Ok(ids.len())
    }

    async fn reclaim_stale_intents(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<usize, BookingError> {
        let mut state = self.inner.state();
        let ids: Vec<IntentId> = state
            .intents_in_order()
            .into_iter()
            .filter(|intent| intent.status == OutboxStatus::Processing)
            .filter(|intent| intent.claimed_at.map(|at| at < cutoff).unwrap_or(true))
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|intent| intent.id)
            .collect();

        for id in &ids {
            if let Some(intent) = state.intents.get_mut(id) {
                intent.status = OutboxStatus::Failed;
                intent.retry_count += 1;
                intent.error_message = Some(PROCESSING_LEASE_EXPIRED.to_string());
            }
        }
        Ok(ids.len())
    }

    async fn dead_letter_intents(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<OutboxIntent>, BookingError> {
        let state = self.inner.state();
        Ok(state
            .intents_in_order()
            .into_iter()
            .filter(|intent| intent.is_dead_letter(max_retries))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}

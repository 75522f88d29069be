use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::{exists, not};
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel::sql_types::BigInt;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::PoolError;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{
    AnsiTransactionManager, AsyncConnection, AsyncPgConnection, RunQueryDsl, TransactionManager,
};
use std::time::Duration;
use tracing::debug;

use super::{BookingStore, StoreTx, TxResult, PROCESSING_LEASE_EXPIRED};
use crate::domain::{
    Booking, BookingId, BookingStatus, CandidateQuery, Car, CarId, CarStatus, ClientId, CompanyId,
    IntentId, LocationId, NewBooking, NewIntent, OutboxIntent, OutboxStatus, RentalWindow,
};
use crate::error::BookingError;
use crate::models::{BookingRow, CarRow, NewBookingRow, NewOutboxRow, OutboxRow};
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

impl From<DieselError> for BookingError {
    fn from(err: DieselError) -> Self {
        BookingError::storage(err.to_string())
    }
}

fn is_lock_timeout(err: &DieselError) -> bool {
    matches!(err, DieselError::DatabaseError(_, info) if info.message().contains("lock timeout"))
}

fn savepoint_name(car_id: CarId) -> String {
    format!("claim_car_{car_id}")
}

fn into_domain<R, D>(rows: Vec<R>) -> Result<Vec<D>, BookingError>
where
    D: TryFrom<R, Error = BookingError>,
{
    rows.into_iter().map(D::try_from).collect()
}

/// PostgreSQL adapter over a bb8 pool of diesel-async connections.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    lock_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: DbPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, BookingError> {
        self.pool
            .get()
            .await
            .map_err(|e: bb8::RunError<PoolError>| {
                BookingError::storage(format!("connection pool: {e}"))
            })
    }
}

struct PgTx<'c> {
    conn: &'c mut AsyncPgConnection,
    lock_timeout: Duration,
}

impl PgTx<'_> {
    fn ensure_in_transaction(&mut self) -> Result<(), BookingError> {
        let depth = <AnsiTransactionManager as TransactionManager<AsyncPgConnection>>::transaction_manager_status_mut(self.conn)
            .transaction_depth()?;
        if depth.is_none() {
            return Err(BookingError::storage(
                "car lock requested outside of a transaction",
            ));
        }
        Ok(())
    }

    async fn rollback_to(&mut self, savepoint: &str) -> Result<(), BookingError> {
        diesel::sql_query(format!("ROLLBACK TO SAVEPOINT {savepoint}"))
            .execute(self.conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreTx for PgTx<'_> {
    async fn lock_car_for_update(&mut self, car_id: CarId) -> Result<Car, BookingError> {
        self.ensure_in_transaction()?;

        let savepoint = savepoint_name(car_id);
        diesel::sql_query(format!("SAVEPOINT {savepoint}"))
            .execute(self.conn)
            .await?;
        diesel::sql_query(format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(self.conn)
        .await?;

        let locked = cars::table
            .filter(cars::id.eq(car_id))
            .filter(cars::deleted.eq(false))
            .select(CarRow::as_select())
            .for_update()
            .first::<CarRow>(self.conn)
            .await
            .optional();

        match locked {
            Ok(Some(row)) => row.try_into(),
            Ok(None) => {
                self.rollback_to(&savepoint).await?;
                Err(BookingError::not_found("Car", car_id))
            }
            Err(err) => {
                self.rollback_to(&savepoint).await?;
                if is_lock_timeout(&err) {
                    debug!(car_id, "lock wait timed out");
                    Err(BookingError::LockContended { car_id })
                } else {
                    Err(err.into())
                }
            }
        }
    }

    async fn release_car_lock(&mut self, car_id: CarId) -> Result<(), BookingError> {
        let savepoint = savepoint_name(car_id);
        self.rollback_to(&savepoint).await?;
        diesel::sql_query(format!("RELEASE SAVEPOINT {savepoint}"))
            .execute(self.conn)
            .await?;
        Ok(())
    }

    async fn has_blocking_overlap(
        &mut self,
        car_id: CarId,
        window: &RentalWindow,
    ) -> Result<bool, BookingError> {
        let overlapping = diesel::select(exists(
            bookings::table
                .filter(bookings::car_id.eq(car_id))
                .filter(bookings::status.eq_any(BookingStatus::blocking_names()))
                .filter(bookings::pickup_time.lt(window.return_time()))
                .filter(bookings::return_time.gt(window.pickup())),
        ))
        .get_result::<bool>(self.conn)
        .await?;
        Ok(overlapping)
    }

    async fn client_exists(&mut self, client_id: ClientId) -> Result<bool, BookingError> {
        let found = diesel::select(exists(
            clients::table
                .filter(clients::id.eq(client_id))
                .filter(clients::deleted.eq(false)),
        ))
        .get_result::<bool>(self.conn)
        .await?;
        Ok(found)
    }

    async fn location_exists(&mut self, location_id: LocationId) -> Result<bool, BookingError> {
        let found = diesel::select(exists(
            rental_locations::table
                .filter(rental_locations::id.eq(location_id))
                .filter(rental_locations::deleted.eq(false)),
        ))
        .get_result::<bool>(self.conn)
        .await?;
        Ok(found)
    }

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<Booking, BookingError> {
        diesel::insert_into(bookings::table)
            .values(NewBookingRow::created(booking, Utc::now()))
            .returning(BookingRow::as_returning())
            .get_result::<BookingRow>(self.conn)
            .await?
            .try_into()
    }

    async fn find_booking(&mut self, id: BookingId) -> Result<Option<Booking>, BookingError> {
        bookings::table
            .find(id)
            .select(BookingRow::as_select())
            .first::<BookingRow>(self.conn)
            .await
            .optional()?
            .map(Booking::try_from)
            .transpose()
    }

    async fn update_booking_status(
        &mut self,
        id: BookingId,
        expected_version: i64,
        status: BookingStatus,
    ) -> Result<Booking, BookingError> {
        let updated = diesel::update(
            bookings::table
                .filter(bookings::id.eq(id))
                .filter(bookings::version.eq(expected_version)),
        )
        .set((
            bookings::status.eq(status.as_str()),
            bookings::version.eq(bookings::version + 1),
            bookings::updated_at.eq(Utc::now()),
        ))
        .returning(BookingRow::as_returning())
        .get_result::<BookingRow>(self.conn)
        .await
        .optional()?;

        if let Some(row) = updated {
            return row.try_into();
        }

        let exists_at_all = diesel::select(exists(bookings::table.filter(bookings::id.eq(id))))
            .get_result::<bool>(self.conn)
            .await?;
        if exists_at_all {
            Err(BookingError::ConcurrencyConflict {
                entity: "Booking",
                id,
            })
        } else {
            Err(BookingError::not_found("Booking", id))
        }
    }

    async fn append_intent(&mut self, intent: NewIntent) -> Result<IntentId, BookingError> {
        let id = diesel::insert_into(outbox_events::table)
            .values(NewOutboxRow::pending(intent, Utc::now()))
            .returning(outbox_events::id)
            .get_result::<i64>(self.conn)
            .await?;
        Ok(id)
    }
}

const PENDING_HEADS_SQL: &str = "\
SELECT o.* FROM outbox_events o \
WHERE o.status = 'PENDING' \
  AND NOT EXISTS ( \
    SELECT 1 FROM outbox_events older \
    WHERE older.aggregate_type = o.aggregate_type \
      AND older.aggregate_id = o.aggregate_id \
      AND older.status <> 'COMPLETED' \
      AND (older.created_at, older.id) < (o.created_at, o.id)) \
ORDER BY o.created_at, o.id \
LIMIT $1";

#[async_trait]
impl BookingStore for PgStore {
    async fn in_transaction<T, F>(&self, work: F) -> Result<T, BookingError>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut dyn StoreTx) -> TxResult<'t, T> + Send + 'static,
    {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let lock_timeout = self.lock_timeout;

        conn.transaction::<T, BookingError, _>(|conn| {
            async move {
                let mut tx = PgTx { conn, lock_timeout };
                work(&mut tx as &mut dyn StoreTx).await
            }
            .scope_boxed()
        })
        .await
    }

    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, BookingError> {
        let mut conn = self.conn().await?;
        bookings::table
            .find(id)
            .select(BookingRow::as_select())
            .first::<BookingRow>(&mut conn)
            .await
            .optional()?
            .map(Booking::try_from)
            .transpose()
    }

    async fn find_free_cars(&self, query: &CandidateQuery) -> Result<Vec<CarId>, BookingError> {
        let mut conn = self.conn().await?;

        let busy = bookings::table
            .filter(bookings::status.eq_any(BookingStatus::blocking_names()))
            .filter(bookings::pickup_time.lt(query.window.return_time()))
            .filter(bookings::return_time.gt(query.window.pickup()))
            .select(bookings::car_id);

        let ids = cars::table
            .inner_join(
                rental_locations::table
                    .on(cars::current_location_id.eq(rental_locations::id.nullable())),
            )
            .inner_join(rental_companies::table.on(rental_companies::id.eq(cars::company_id)))
            .filter(cars::model_id.eq(query.model_id))
            .filter(cars::current_location_id.eq(query.location_id))
            .filter(cars::status.eq(CarStatus::Available.as_str()))
            .filter(cars::deleted.eq(false))
            .filter(rental_locations::deleted.eq(false))
            .filter(rental_companies::deleted.eq(false))
            .filter(not(cars::id.eq_any(busy)))
            .order(cars::id.asc())
            .limit(query.limit)
            .select(cars::id)
            .load::<i64>(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn active_bookings_for_company(
        &self,
        company_id: CompanyId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BookingError> {
        let mut conn = self.conn().await?;
        let rows = bookings::table
            .inner_join(cars::table)
            .filter(cars::company_id.eq(company_id))
            .filter(bookings::status.eq_any(BookingStatus::active_names()))
            .filter(bookings::return_time.ge(now))
            .order((bookings::pickup_time.asc(), bookings::id.asc()))
            .select(BookingRow::as_select())
            .load::<BookingRow>(&mut conn)
            .await?;
        into_domain(rows)
    }

    async fn active_bookings_for_location(
        &self,
        location_id: LocationId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Booking>, BookingError> {
        let mut conn = self.conn().await?;
        let rows = bookings::table
            .filter(
                bookings::pickup_location_id
                    .eq(location_id)
                    .or(bookings::return_location_id.eq(location_id)),
            )
            .filter(bookings::status.eq_any(BookingStatus::active_names()))
            .filter(bookings::return_time.ge(now))
            .order((bookings::pickup_time.asc(), bookings::id.asc()))
            .select(BookingRow::as_select())
            .load::<BookingRow>(&mut conn)
            .await?;
        into_domain(rows)
    }

    async fn bookings_for_location_in_period(
        &self,
        location_id: LocationId,
        window: &RentalWindow,
    ) -> Result<Vec<Booking>, BookingError> {
        let mut conn = self.conn().await?;
        let rows = bookings::table
            .filter(
                bookings::pickup_location_id
                    .eq(location_id)
                    .or(bookings::return_location_id.eq(location_id)),
            )
            .filter(bookings::pickup_time.lt(window.return_time()))
            .filter(bookings::return_time.gt(window.pickup()))
            .order((bookings::pickup_time.asc(), bookings::id.asc()))
            .select(BookingRow::as_select())
            .load::<BookingRow>(&mut conn)
            .await?;
        into_domain(rows)
    }

    async fn fetch_pending_intents(&self, limit: i64) -> Result<Vec<OutboxIntent>, BookingError> {
        let mut conn = self.conn().await?;
        let rows = diesel::sql_query(PENDING_HEADS_SQL)
            .bind::<BigInt, _>(limit)
            .load::<OutboxRow>(&mut conn)
            .await?;
        into_domain(rows)
    }

    async fn mark_intent_processing(
        &self,
        id: IntentId,
        now: DateTime<Utc>,
    ) -> Result<bool, BookingError> {
        let mut conn = self.conn().await?;
        let claimed = diesel::update(
            outbox_events::table
                .filter(outbox_events::id.eq(id))
                .filter(outbox_events::status.eq(OutboxStatus::Pending.as_str())),
        )
        .set((
            outbox_events::status.eq(OutboxStatus::Processing.as_str()),
            outbox_events::claimed_at.eq(Some(now)),
        ))
        .execute(&mut conn)
        .await?;
        Ok(claimed == 1)
    }

    async fn mark_intent_completed(
        &self,
        id: IntentId,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(id)))
            .set((
                outbox_events::status.eq(OutboxStatus::Completed.as_str()),
                outbox_events::processed_at.eq(Some(now)),
                outbox_events::error_message.eq(None::<String>),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn mark_intent_failed(&self, id: IntentId, message: &str) -> Result<(), BookingError> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(id)))
            .set((
                outbox_events::status.eq(OutboxStatus::Failed.as_str()),
                outbox_events::retry_count.eq(outbox_events::retry_count + 1),
                outbox_events::error_message.eq(Some(message)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue_failed_intents(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<usize, BookingError> {
        let mut conn = self.conn().await?;
        let ids = outbox_events::table
            .filter(outbox_events::status.eq(OutboxStatus::Failed.as_str()))
            .filter(outbox_events::retry_count.lt(max_retries))
            .order((outbox_events::created_at.asc(), outbox_events::id.asc()))
            .limit(limit)
            .select(outbox_events::id)
            .load::<i64>(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let requeued = diesel::update(
            outbox_events::table
                .filter(outbox_events::id.eq_any(ids))
                .filter(outbox_events::status.eq(OutboxStatus::Failed.as_str())),
        )
        .set((
            outbox_events::status.eq(OutboxStatus::Pending.as_str()),
            outbox_events::error_message.eq(None::<String>),
            outbox_events::claimed_at.eq(None::<DateTime<Utc>>),
        ))
        .execute(&mut conn)
        .await?;
        Ok(requeued)
    }

    async fn reclaim_stale_intents(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<usize, BookingError> {
        let mut conn = self.conn().await?;
        let ids = outbox_events::table
            .filter(outbox_events::status.eq(OutboxStatus::Processing.as_str()))
            .filter(outbox_events::claimed_at.lt(cutoff))
            .order((outbox_events::created_at.asc(), outbox_events::id.asc()))
            .limit(limit)
            .select(outbox_events::id)
            .load::<i64>(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let reclaimed = diesel::update(
            outbox_events::table
                .filter(outbox_events::id.eq_any(ids))
                .filter(outbox_events::status.eq(OutboxStatus::Processing.as_str())),
        )
        .set((
            outbox_events::status.eq(OutboxStatus::Failed.as_str()),
            outbox_events::retry_count.eq(outbox_events::retry_count + 1),
            outbox_events::error_message.eq(Some(PROCESSING_LEASE_EXPIRED)),
        ))
        .execute(&mut conn)
        .await?;
        Ok(reclaimed)
    }

    async fn dead_letter_intents(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<OutboxIntent>, BookingError> {
        let mut conn = self.conn().await?;
        let rows = outbox_events::table
            .filter(outbox_events::status.eq(OutboxStatus::Failed.as_str()))
            .filter(outbox_events::retry_count.ge(max_retries))
            .order((outbox_events::created_at.asc(), outbox_events::id.asc()))
            .limit(limit)
            .select(OutboxRow::as_select())
            .load::<OutboxRow>(&mut conn)
            .await?;
        into_domain(rows)
    }
}

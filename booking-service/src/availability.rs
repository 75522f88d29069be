use crate::domain::{CandidateQuery, CarId, RentalWindow};
use crate::error::BookingError;
use crate::store::{BookingStore, StoreTx};

/// True when no inventory-blocking booking on the car overlaps `window`.
///
/// Authoritative only while the caller holds the car's lock in `tx`.
pub async fn is_free(
    tx: &mut dyn StoreTx,
    car_id: CarId,
    window: &RentalWindow,
) -> Result<bool, BookingError> {
    Ok(!tx.has_blocking_overlap(car_id, window).await?)
}

/// Advisory shortlist of free cars, ordered by id. Claiming re-checks each
/// entry under its lock.
pub async fn find_free_cars<S: BookingStore>(
    store: &S,
    query: &CandidateQuery,
) -> Result<Vec<CarId>, BookingError> {
    if query.limit <= 0 {
        return Err(BookingError::validation("limit must be positive"));
    }
    store.find_free_cars(query).await
}

use tracing::debug;

use crate::availability;
use crate::domain::{Car, CarId, RentalWindow};
use crate::error::BookingError;
use crate::store::StoreTx;

pub const CAR_NOT_AVAILABLE: &str = "Car is not available";
pub const INVENTORY_CHANGED: &str = "Inventory changed; no cars available at this moment.";

/// Locks `car_id` and confirms it can take `window`.
///
/// The lock stays with `tx` so the caller can insert the booking before
/// commit. Lock contention surfaces to the caller as `LockContended`.
pub async fn claim_exact(
    tx: &mut dyn StoreTx,
    car_id: CarId,
    window: &RentalWindow,
) -> Result<Car, BookingError> {
    let car = tx.lock_car_for_update(car_id).await?;
    if !car.status.is_rentable() || !availability::is_free(tx, car_id, window).await? {
        return Err(BookingError::business_rule(CAR_NOT_AVAILABLE));
    }
    Ok(car)
}

/// Claims the first candidate that is both lockable and free, in list order.
///
/// Candidates locked by someone else or deleted since the shortlist was built
/// are skipped without waiting on them.
pub async fn claim_first_available(
    tx: &mut dyn StoreTx,
    candidates: &[CarId],
    window: &RentalWindow,
) -> Result<Car, BookingError> {
    for &car_id in candidates {
        let car = match tx.lock_car_for_update(car_id).await {
            Ok(car) => car,
            Err(BookingError::LockContended { .. }) => {
                debug!(car_id, "candidate locked by a concurrent booking, skipping");
                continue;
            }
            Err(BookingError::NotFound { .. }) => {
                debug!(car_id, "candidate disappeared, skipping");
                continue;
            }
            Err(err) => return Err(err),
        };

        if car.status.is_rentable() && availability::is_free(tx, car_id, window).await? {
            return Ok(car);
        }
        debug!(car_id, "candidate taken since shortlist, releasing");
        tx.release_car_lock(car_id).await?;
    }
    Err(BookingError::business_rule(INVENTORY_CHANGED))
}

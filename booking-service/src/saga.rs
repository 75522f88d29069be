use chrono::Utc;
use shared::{BookingCanceled, BookingConfirmed, IntentType, PaymentRequested, PaymentResponse};
use tracing::{info, warn};

use crate::domain::{Booking, BookingId, BookingStatus, NewIntent};
use crate::error::BookingError;
use crate::retry::{retry_on_conflict, RetryPolicy};
use crate::store::{BookingStore, StoreTx};

pub const CANCELED_BY_CLIENT: &str = "canceled by client";

/// What reconciling a payment response did to the booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied(BookingStatus),
    AlreadySettled(BookingStatus),
    Ignored(BookingStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Confirm,
    Cancel,
    AlreadySettled,
    Ignore,
    Reject,
}

fn decide(status: BookingStatus, payment_succeeded: bool) -> Decision {
    use BookingStatus::*;
    match (status, payment_succeeded) {
        (Pending, true) => Decision::Confirm,
        (Pending, false) => Decision::Cancel,
        (Confirmed, true) | (Canceled, false) => Decision::AlreadySettled,
        (Confirmed, false) | (Canceled, true) | (Completed, _) => Decision::Ignore,
        (Created, _) => Decision::Reject,
    }
}

/// Moves a freshly created booking to `PENDING` and queues its payment
/// request. Must run in the transaction that inserted the booking.
pub async fn start_saga(tx: &mut dyn StoreTx, booking: Booking) -> Result<Booking, BookingError> {
    if booking.status != BookingStatus::Created {
        return Err(BookingError::InvalidTransition {
            id: booking.id,
            from: booking.status,
            to: BookingStatus::Pending,
        });
    }

    let pending = tx
        .update_booking_status(booking.id, booking.version, BookingStatus::Pending)
        .await?;
    let request = PaymentRequested {
        booking_id: pending.id,
        client_id: pending.client_id,
        amount_cents: pending.total_price_cents,
        currency: pending.currency.clone(),
        requested_at: Utc::now(),
    };
    tx.append_intent(NewIntent::for_booking(
        pending.id,
        IntentType::PaymentRequested,
        &request,
    )?)
    .await?;

    info!("Booking {} pending payment of {} cents", pending.id, pending.total_price_cents);
    Ok(pending)
}

async fn apply_payment_result(
    tx: &mut dyn StoreTx,
    response: &PaymentResponse,
) -> Result<ReconcileOutcome, BookingError> {
    let id = response.booking_id;
    let booking = tx
        .find_booking(id)
        .await?
        .ok_or_else(|| BookingError::not_found("Booking", id))?;

    match decide(booking.status, response.success) {
        Decision::Confirm => {
            let transaction_id = response.transaction_id.clone().ok_or_else(|| {
                BookingError::validation(format!(
                    "approved payment for booking {id} has no transaction id"
                ))
            })?;
            tx.update_booking_status(id, booking.version, BookingStatus::Confirmed)
                .await?;
            tx.append_intent(NewIntent::for_booking(
                id,
                IntentType::BookingConfirmed,
                &BookingConfirmed {
                    booking_id: id,
                    transaction_id: transaction_id.clone(),
                },
            )?)
            .await?;
            info!("Booking {} confirmed, transaction {}", id, transaction_id);
            Ok(ReconcileOutcome::Applied(BookingStatus::Confirmed))
        }
        Decision::Cancel => {
            let reason = response.decline_reason();
            tx.update_booking_status(id, booking.version, BookingStatus::Canceled)
                .await?;
            tx.append_intent(NewIntent::for_booking(
                id,
                IntentType::BookingCanceled,
                &BookingCanceled {
                    booking_id: id,
                    reason: reason.clone(),
                },
            )?)
            .await?;
            info!("Booking {} canceled: {}", id, reason);
            Ok(ReconcileOutcome::Applied(BookingStatus::Canceled))
        }
        Decision::AlreadySettled => {
            info!("Booking {} already {}, duplicate payment result", id, booking.status);
            Ok(ReconcileOutcome::AlreadySettled(booking.status))
        }
        Decision::Ignore => {
            warn!(
                "Ignoring payment result (success={}) for booking {} in status {}",
                response.success, id, booking.status
            );
            Ok(ReconcileOutcome::Ignored(booking.status))
        }
        Decision::Reject => Err(BookingError::InvalidTransition {
            id,
            from: booking.status,
            to: if response.success {
                BookingStatus::Confirmed
            } else {
                BookingStatus::Canceled
            },
        }),
    }
}

async fn cancel_in_tx(tx: &mut dyn StoreTx, id: BookingId) -> Result<Booking, BookingError> {
    let booking = tx
        .find_booking(id)
        .await?
        .ok_or_else(|| BookingError::not_found("Booking", id))?;
    if booking.status.is_terminal() {
        return Ok(booking);
    }

    let canceled = tx
        .update_booking_status(id, booking.version, BookingStatus::Canceled)
        .await?;
    tx.append_intent(NewIntent::for_booking(
        id,
        IntentType::BookingCanceled,
        &BookingCanceled {
            booking_id: id,
            reason: CANCELED_BY_CLIENT.to_string(),
        },
    )?)
    .await?;
    info!("Booking {} canceled by client", id);
    Ok(canceled)
}

/// Owns booking status transitions after creation.
#[derive(Clone)]
pub struct SagaManager<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: BookingStore> SagaManager<S> {
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn reconcile_payment_result(
        &self,
        response: PaymentResponse,
    ) -> Result<ReconcileOutcome, BookingError> {
        retry_on_conflict(self.retry, || {
            let response = response.clone();
            self.store.in_transaction(move |tx| {
                Box::pin(async move { apply_payment_result(tx, &response).await })
            })
        })
        .await
    }

    /// Cancels a live booking; terminal bookings come back unchanged.
    pub async fn cancel(&self, id: BookingId) -> Result<Booking, BookingError> {
        retry_on_conflict(self.retry, || {
            self.store
                .in_transaction(move |tx| Box::pin(async move { cancel_in_tx(tx, id).await }))
        })
        .await
    }
}

use async_trait::async_trait;
use rand::Rng;
use shared::{PaymentRequested, PaymentResponse};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{PaymentError, PaymentGateway};

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub success_rate: f64,
    pub outage_rate: f64,
    pub min_latency: Duration,
    pub max_latency: Duration,
    /// Approvals kept for idempotent replays; the oldest is forgotten first.
    pub remembered_approvals: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            success_rate: 0.6,
            outage_rate: 0.0,
            min_latency: Duration::from_millis(1000),
            max_latency: Duration::from_millis(3000),
            remembered_approvals: 10_000,
        }
    }
}

#[derive(Debug, Default)]
struct ApprovalLedger {
    by_booking: HashMap<i64, String>,
    order: VecDeque<i64>,
}

impl ApprovalLedger {
    fn record(&mut self, booking_id: i64, transaction_id: String, capacity: usize) -> String {
        if let Some(existing) = self.by_booking.get(&booking_id) {
            return existing.clone();
        }
        while self.order.len() >= capacity.max(1) {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.by_booking.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(booking_id);
        self.by_booking.insert(booking_id, transaction_id.clone());
        transaction_id
    }
}

/// In-process stand-in for a card processor.
///
/// Approvals are remembered per booking, so a retried request for a booking
/// that was already charged gets the first transaction id back instead of
/// a second charge. Only the most recent `remembered_approvals` bookings are
/// kept; by then the saga has long settled the older ones.
pub struct PaymentSimulator {
    config: SimulatorConfig,
    settled: Mutex<ApprovalLedger>,
}

impl PaymentSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            settled: Mutex::new(ApprovalLedger::default()),
        }
    }

    fn settled_transaction(&self, booking_id: i64) -> Option<String> {
        self.settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_booking
            .get(&booking_id)
            .cloned()
    }

    fn record_approval(&self, booking_id: i64, transaction_id: String) -> String {
        self.settled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(booking_id, transaction_id, self.config.remembered_approvals)
    }

    fn roll(&self) -> (Duration, f64, f64) {
        let min = self.config.min_latency.as_millis() as u64;
        let max = (self.config.max_latency.as_millis() as u64).max(min);
        let mut rng = rand::thread_rng();
        let delay = Duration::from_millis(rng.gen_range(min..=max));
        (delay, rng.gen::<f64>(), rng.gen::<f64>())
    }
}

#[async_trait]
impl PaymentGateway for PaymentSimulator {
    async fn process_payment(
        &self,
        request: &PaymentRequested,
    ) -> Result<PaymentResponse, PaymentError> {
        if request.amount_cents < 0 {
            return Err(PaymentError::InvalidRequest(format!(
                "negative amount {} for booking {}",
                request.amount_cents, request.booking_id
            )));
        }

        info!(
            "Processing payment for booking {} amount {} {}",
            request.booking_id, request.amount_cents, request.currency
        );

        if let Some(transaction_id) = self.settled_transaction(request.booking_id) {
            info!(
                "Booking {} already charged, returning transaction {}",
                request.booking_id, transaction_id
            );
            return Ok(PaymentResponse::approved(request.booking_id, transaction_id));
        }

        let (delay, outage_roll, approval_roll) = self.roll();
        tokio::time::sleep(delay).await;

        if outage_roll < self.config.outage_rate {
            warn!("Payment gateway unavailable for booking {}", request.booking_id);
            return Err(PaymentError::Unavailable(
                "simulated gateway outage".to_string(),
            ));
        }

        if approval_roll < self.config.success_rate {
            let transaction_id = self.record_approval(
                request.booking_id,
                format!("TXN-{}", Uuid::new_v4().simple()),
            );
            info!(
                "Payment successful for booking {} transaction {}",
                request.booking_id, transaction_id
            );
            Ok(PaymentResponse::approved(request.booking_id, transaction_id))
        } else {
            warn!("Payment failed for booking {}", request.booking_id);
            Ok(PaymentResponse::declined(
                request.booking_id,
                "Payment declined by bank",
            ))
        }
    }
}

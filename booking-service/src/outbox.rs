use chrono::Utc;
use futures::stream::{self, StreamExt};
use payment_service::{PaymentError, PaymentGateway};
use shared::{IntentType, PaymentRequested};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::OutboxIntent;
use crate::error::BookingError;
use crate::publisher::{NotificationPublisher, PublishError};
use crate::saga::SagaManager;
use crate::store::BookingStore;

const DEAD_LETTER_SCAN_LIMIT: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: IntentType,
        source: serde_json::Error,
    },

    #[error("payment gateway: {0}")]
    Payment(#[from] PaymentError),

    #[error("reconcile failed: {0}")]
    Saga(#[from] BookingError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),
}

/// Performs the external effect an intent stands for.
pub struct IntentDispatcher<S> {
    saga: SagaManager<S>,
    gateway: Arc<dyn PaymentGateway>,
    publisher: Arc<dyn NotificationPublisher>,
}

impl<S: BookingStore> IntentDispatcher<S> {
    pub fn new(
        saga: SagaManager<S>,
        gateway: Arc<dyn PaymentGateway>,
        publisher: Arc<dyn NotificationPublisher>,
    ) -> Self {
        Self {
            saga,
            gateway,
            publisher,
        }
    }

    pub async fn dispatch(&self, intent: &OutboxIntent) -> Result<(), DispatchError> {
        let kind = match intent.intent_type() {
            Ok(kind) => kind,
            Err(unknown) => {
                warn!("Skipping outbox intent {}: {}", intent.id, unknown);
                return Ok(());
            }
        };

        match kind {
            IntentType::PaymentRequested => {
                let request: PaymentRequested = serde_json::from_value(intent.payload.clone())
                    .map_err(|source| DispatchError::Payload { kind, source })?;
                let response = self.gateway.process_payment(&request).await?;
                let outcome = self.saga.reconcile_payment_result(response).await?;
                debug!("Payment for booking {} reconciled: {:?}", request.booking_id, outcome);
            }
            IntentType::BookingConfirmed | IntentType::BookingCanceled => {
                self.publisher.publish(intent).await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub dispatch_interval: Duration,
    pub retry_interval: Duration,
    pub reclaim_interval: Duration,
    pub batch_size: i64,
    pub retry_batch_size: i64,
    pub max_retries: i32,
    pub workers: usize,
    pub dispatch_timeout: Duration,
    pub processing_lease: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_secs(20),
            retry_interval: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(60),
            batch_size: 10,
            retry_batch_size: 5,
            max_retries: 3,
            workers: 4,
            dispatch_timeout: Duration::from_secs(30),
            processing_lease: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub requeued: usize,
    pub dead_letters: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntentOutcome {
    Completed,
    Failed,
    Skipped,
}

pub struct OutboxProcessor<S> {
    store: S,
    dispatcher: IntentDispatcher<S>,
    config: RelayConfig,
}

impl<S: BookingStore> OutboxProcessor<S> {
    pub fn new(store: S, dispatcher: IntentDispatcher<S>, config: RelayConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// Drives the dispatch, retry and reclaim sweeps until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut dispatch = time::interval(self.config.dispatch_interval);
        let mut retry = time::interval(self.config.retry_interval);
        let mut reclaim = time::interval(self.config.reclaim_interval);
        for ticker in [&mut dispatch, &mut retry, &mut reclaim] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = dispatch.tick() => match self.process_outbox_events().await {
                    Ok(report) if report.claimed > 0 || report.skipped > 0 => {
                        info!("Outbox sweep: {:?}", report);
                    }
                    Ok(_) => {}
                    Err(e) => error!("Error processing outbox events: {}", e),
                },
                _ = retry.tick() => if let Err(e) = self.retry_failed_events().await {
                    error!("Error requeueing failed outbox events: {}", e);
                },
                _ = reclaim.tick() => if let Err(e) = self.reclaim_stale_events().await {
                    error!("Error reclaiming stale outbox events: {}", e);
                },
                _ = shutdown.changed() => {
                    info!("Outbox processor stopping");
                    break;
                }
            }
        }
    }

    /// Claims and dispatches one batch of eligible intents.
    pub async fn process_outbox_events(&self) -> Result<SweepReport, BookingError> {
        let batch = self
            .store
            .fetch_pending_intents(self.config.batch_size)
            .await?;

        let outcomes: Vec<IntentOutcome> = stream::iter(batch)
            .map(|intent| self.process_intent(intent))
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut report = SweepReport::default();
        for outcome in outcomes {
            match outcome {
                IntentOutcome::Completed => {
                    report.claimed += 1;
                    report.completed += 1;
                }
                IntentOutcome::Failed => {
                    report.claimed += 1;
                    report.failed += 1;
                }
                IntentOutcome::Skipped => report.skipped += 1,
            }
        }
        Ok(report)
    }

    async fn process_intent(&self, intent: OutboxIntent) -> IntentOutcome {
        match self.store.mark_intent_processing(intent.id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Outbox intent {} already claimed", intent.id);
                return IntentOutcome::Skipped;
            }
            Err(e) => {
                error!("Failed to claim outbox intent {}: {}", intent.id, e);
                return IntentOutcome::Skipped;
            }
        }

        let timeout = self.config.dispatch_timeout;
        let result = match time::timeout(timeout, self.dispatcher.dispatch(&intent)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(timeout)),
        };

        match result {
            Ok(()) => match self.store.mark_intent_completed(intent.id, Utc::now()).await {
                Ok(()) => {
                    info!("Processed outbox intent {} ({})", intent.id, intent.event_type);
                    IntentOutcome::Completed
                }
                Err(e) => {
                    error!("Failed to complete outbox intent {}: {}", intent.id, e);
                    IntentOutcome::Failed
                }
            },
            Err(e) => {
                warn!(
                    "Outbox intent {} ({}) failed: {}",
                    intent.id, intent.event_type, e
                );
                if let Err(store_err) = self.store.mark_intent_failed(intent.id, &e.to_string()).await {
                    error!("Failed to record failure of outbox intent {}: {}", intent.id, store_err);
                }
                IntentOutcome::Failed
            }
        }
    }

    /// Puts retryable failures back in line and reports exhausted ones.
    pub async fn retry_failed_events(&self) -> Result<RetryReport, BookingError> {
        let requeued = self
            .store
            .requeue_failed_intents(self.config.max_retries, self.config.retry_batch_size)
            .await?;
        if requeued > 0 {
            info!("Requeued {} failed outbox intents", requeued);
        }

        let dead_letters = self
            .store
            .dead_letter_intents(self.config.max_retries, DEAD_LETTER_SCAN_LIMIT)
            .await?
            .len();
        if dead_letters > 0 {
            warn!(
                "{} outbox intents exhausted {} retries and need operator attention",
                dead_letters, self.config.max_retries
            );
        }
        Ok(RetryReport {
            requeued,
            dead_letters,
        })
    }

    /// Fails intents stuck in `PROCESSING` past the lease.
    pub async fn reclaim_stale_events(&self) -> Result<usize, BookingError> {
        let lease = chrono::Duration::from_std(self.config.processing_lease)
            .map_err(|e| BookingError::validation(format!("processing lease: {e}")))?;
        let reclaimed = self
            .store
            .reclaim_stale_intents(Utc::now() - lease, self.config.batch_size)
            .await?;
        if reclaimed > 0 {
            warn!("Reclaimed {} outbox intents past their processing lease", reclaimed);
        }
        Ok(reclaimed)
    }

    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<OutboxIntent>, BookingError> {
        if limit <= 0 {
            return Err(BookingError::validation("limit must be positive"));
        }
        self.store
            .dead_letter_intents(self.config.max_retries, limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BookingStatus, NewBooking, OutboxStatus, RentalWindow};
    use crate::retry::RetryPolicy;
    use crate::saga::start_saga;
    use crate::store::memory::CarSeed;
    use crate::store::{MemoryStore, PROCESSING_LEASE_EXPIRED};
    use async_trait::async_trait;
    use mockall::mock;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use shared::PaymentResponse;
    use std::sync::Mutex;

    mock! {
        Gateway {}

        #[async_trait]
        impl PaymentGateway for Gateway {
            async fn process_payment(
                &self,
                request: &PaymentRequested,
            ) -> Result<PaymentResponse, PaymentError>;
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationPublisher for RecordingPublisher {
        async fn publish(&self, intent: &OutboxIntent) -> Result<(), PublishError> {
            self.seen.lock().unwrap().push(intent.event_type.clone());
            Ok(())
        }
    }

    struct SlowGateway;

    #[async_trait]
    impl PaymentGateway for SlowGateway {
        async fn process_payment(
            &self,
            request: &PaymentRequested,
        ) -> Result<PaymentResponse, PaymentError> {
            time::sleep(Duration::from_secs(5)).await;
            Ok(PaymentResponse::approved(request.booking_id, "TXN-SLOW"))
        }
    }

    fn config() -> RelayConfig {
        RelayConfig {
            dispatch_timeout: Duration::from_millis(50),
            ..RelayConfig::default()
        }
    }

    struct Relay {
        store: MemoryStore,
        processor: OutboxProcessor<MemoryStore>,
        publisher: Arc<RecordingPublisher>,
    }

    fn relay(gateway: impl PaymentGateway + 'static) -> Relay {
        let store = MemoryStore::new(Duration::from_millis(50));
        let saga = SagaManager::new(
            store.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        );
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = IntentDispatcher::new(saga, Arc::new(gateway), publisher.clone());
        Relay {
            processor: OutboxProcessor::new(store.clone(), dispatcher, config()),
            store,
            publisher,
        }
    }

    async fn pending_booking(store: &MemoryStore) -> i64 {
        let company = store.add_company();
        let location = store.add_location(company);
        let client = store.add_client();
        let car = store.add_car(CarSeed {
            company_id: company,
            model_id: 1,
            location_id: location,
            plate_number: format!("OBX-{company}"),
            daily_price_cents: 5_000,
        });
        let new = NewBooking {
            client_id: client,
            car_id: car,
            pickup_location_id: location,
            return_location_id: location,
            window: RentalWindow::new(
                "2024-06-01T00:00:00Z".parse().unwrap(),
                "2024-06-02T00:00:00Z".parse().unwrap(),
            )
            .unwrap(),
            total_price_cents: 5_000,
            currency: "USD".to_string(),
        };
        store
            .in_transaction(move |tx| {
                Box::pin(async move {
                    let booking = tx.insert_booking(&new).await?;
                    start_saga(tx, booking).await
                })
            })
            .await
            .unwrap()
            .id
    }

    fn intent_of(store: &MemoryStore, kind: &str) -> OutboxIntent {
        store
            .intents()
            .into_iter()
            .find(|intent| intent.event_type == kind)
            .unwrap()
    }

    async fn booking_status(store: &MemoryStore, id: i64) -> BookingStatus {
        store.find_booking(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn approved_payment_confirms_and_notifies() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_process_payment()
            .times(1)
            .returning(|request| Ok(PaymentResponse::approved(request.booking_id, "TXN-42")));
        let relay = relay(gateway);
        let booking_id = pending_booking(&relay.store).await;

        let report = relay.processor.process_outbox_events().await.unwrap();

        assert_eq!(
            report,
            SweepReport {
                claimed: 1,
                completed: 1,
                failed: 0,
                skipped: 0
            }
        );
        let payment = intent_of(&relay.store, "PAYMENT_REQUESTED");
        assert_eq!(payment.status, OutboxStatus::Completed);
        assert!(payment.processed_at.is_some());
        assert_eq!(payment.retry_count, 0);
        assert_eq!(booking_status(&relay.store, booking_id).await, BookingStatus::Confirmed);
        let confirmed = intent_of(&relay.store, "BOOKING_CONFIRMED");
        assert_eq!(confirmed.status, OutboxStatus::Pending);
        assert_eq!(confirmed.payload["transaction_id"], "TXN-42");

        relay.processor.process_outbox_events().await.unwrap();
        assert_eq!(
            *relay.publisher.seen.lock().unwrap(),
            vec!["BOOKING_CONFIRMED".to_string()]
        );
    }

    #[tokio::test]
    async fn declined_payment_cancels() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_process_payment()
            .returning(|request| Ok(PaymentResponse::declined(request.booking_id, "Payment declined by bank")));
        let relay = relay(gateway);
        let booking_id = pending_booking(&relay.store).await;

        relay.processor.process_outbox_events().await.unwrap();

        assert_eq!(booking_status(&relay.store, booking_id).await, BookingStatus::Canceled);
        assert_eq!(
            intent_of(&relay.store, "BOOKING_CANCELED").payload["reason"],
            "Payment declined by bank"
        );
    }

    #[tokio::test]
    async fn outage_marks_intent_failed() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_process_payment()
            .returning(|_| Err(PaymentError::Unavailable("bank offline".to_string())));
        let relay = relay(gateway);
        let booking_id = pending_booking(&relay.store).await;

        let report = relay.processor.process_outbox_events().await.unwrap();

        assert_eq!(report.failed, 1);
        let payment = intent_of(&relay.store, "PAYMENT_REQUESTED");
        assert_eq!(payment.status, OutboxStatus::Failed);
        assert_eq!(payment.retry_count, 1);
        assert!(payment.error_message.unwrap().contains("bank offline"));
        assert_eq!(booking_status(&relay.store, booking_id).await, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn exhausted_intent_becomes_a_dead_letter() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_process_payment()
            .times(3)
            .returning(|_| Err(PaymentError::Unavailable("bank offline".to_string())));
        let relay = relay(gateway);
        pending_booking(&relay.store).await;

        for round in 1..=3 {
            relay.processor.process_outbox_events().await.unwrap();
            let retry = relay.processor.retry_failed_events().await.unwrap();
            if round < 3 {
                assert_eq!(retry.requeued, 1);
            } else {
                assert_eq!(
                    retry,
                    RetryReport {
                        requeued: 0,
                        dead_letters: 1
                    }
                );
            }
        }

        let report = relay.processor.process_outbox_events().await.unwrap();
        assert_eq!(report, SweepReport::default());
        let payment = intent_of(&relay.store, "PAYMENT_REQUESTED");
        assert_eq!(payment.status, OutboxStatus::Failed);
        assert_eq!(payment.retry_count, 3);
        assert_eq!(relay.processor.dead_letters(10).await.unwrap(), vec![payment]);
    }

    #[rstest]
    #[case(0)]
    #[case(-5)]
    #[tokio::test]
    async fn dead_letter_listing_needs_a_positive_limit(#[case] limit: i64) {
        let relay = relay(MockGateway::new());

        let err = relay.processor.dead_letters(limit).await.unwrap_err();

        assert!(matches!(err, BookingError::Validation(_)));
    }

    #[tokio::test]
    async fn newer_intent_waits_for_older_one() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_process_payment()
            .returning(|_| Err(PaymentError::Unavailable("bank offline".to_string())));
        let relay = relay(gateway);
        let booking_id = pending_booking(&relay.store).await;
        let saga = SagaManager::new(relay.store.clone(), RetryPolicy::default());
        saga.cancel(booking_id).await.unwrap();

        let report = relay.processor.process_outbox_events().await.unwrap();

        assert_eq!(report.claimed, 1);
        assert!(relay.publisher.seen.lock().unwrap().is_empty());
        assert_eq!(
            intent_of(&relay.store, "BOOKING_CANCELED").status,
            OutboxStatus::Pending
        );
    }

    #[tokio::test]
    async fn intents_of_different_bookings_go_out_together() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_process_payment()
            .times(2)
            .returning(|request| Ok(PaymentResponse::approved(request.booking_id, "TXN")));
        let relay = relay(gateway);
        pending_booking(&relay.store).await;
        pending_booking(&relay.store).await;

        let report = relay.processor.process_outbox_events().await.unwrap();

        assert_eq!(report.completed, 2);
    }

    #[tokio::test]
    async fn slow_dispatch_times_out() {
        let relay = relay(SlowGateway);
        pending_booking(&relay.store).await;

        let report = relay.processor.process_outbox_events().await.unwrap();

        assert_eq!(report.failed, 1);
        let payment = intent_of(&relay.store, "PAYMENT_REQUESTED");
        assert!(payment.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn stale_processing_claim_is_reclaimed() {
        let relay = relay(MockGateway::new());
        pending_booking(&relay.store).await;
        pending_booking(&relay.store).await;
        let intents = relay.store.intents();
        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        assert!(relay
            .store
            .mark_intent_processing(intents[0].id, long_ago)
            .await
            .unwrap());
        assert!(relay
            .store
            .mark_intent_processing(intents[1].id, Utc::now())
            .await
            .unwrap());

        let reclaimed = relay.processor.reclaim_stale_events().await.unwrap();

        assert_eq!(reclaimed, 1);
        let after = relay.store.intents();
        assert_eq!(after[0].status, OutboxStatus::Failed);
        assert_eq!(after[0].retry_count, 1);
        assert_eq!(after[0].error_message.as_deref(), Some(PROCESSING_LEASE_EXPIRED));
        assert_eq!(after[1].status, OutboxStatus::Processing);
        assert_eq!(after[1].retry_count, 0);
    }

    #[tokio::test]
    async fn unknown_intent_types_are_dropped_quietly() {
        let relay = relay(MockGateway::new());
        let intent = OutboxIntent {
            id: 1,
            aggregate_type: "Booking".to_string(),
            aggregate_id: "1".to_string(),
            event_type: "SHIPMENT_SENT".to_string(),
            payload: serde_json::json!({}),
            status: OutboxStatus::Processing,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            claimed_at: None,
            processed_at: None,
        };

        relay.processor.dispatcher.dispatch(&intent).await.unwrap();
        assert!(relay.publisher.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_payment_payload_fails_dispatch() {
        let relay = relay(MockGateway::new());
        let intent = OutboxIntent {
            id: 1,
            aggregate_type: "Booking".to_string(),
            aggregate_id: "1".to_string(),
            event_type: "PAYMENT_REQUESTED".to_string(),
            payload: serde_json::json!({"booking_id": "not-a-number"}),
            status: OutboxStatus::Processing,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            claimed_at: None,
            processed_at: None,
        };

        let err = relay.processor.dispatcher.dispatch(&intent).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Payload {
                kind: IntentType::PaymentRequested,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let relay = relay(MockGateway::new());
        let (tx, rx) = watch::channel(false);
        let processor = Arc::new(relay.processor);
        let runner = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run(rx).await })
        };

        tx.send(true).unwrap();
        time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Payment step of the booking saga.
//!
//! The booking core only ever reaches a payment provider through
//! [`PaymentGateway`]: one request in, one response out. A declined card is a
//! regular [`PaymentResponse`] with `success == false`; [`PaymentError`] is
//! reserved for failures where the outcome is unknown and the caller should
//! try again later.

mod simulator;

use async_trait::async_trait;
use shared::{PaymentRequested, PaymentResponse};

pub use simulator::{PaymentSimulator, SimulatorConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("invalid payment request: {0}")]
    InvalidRequest(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charges the client for a booking. May take several seconds and may be
    /// called more than once for the same booking.
    async fn process_payment(
        &self,
        request: &PaymentRequested,
    ) -> Result<PaymentResponse, PaymentError>;
}

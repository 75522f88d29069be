use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const BOOKING_AGGREGATE: &str = "Booking";
pub const DEFAULT_CURRENCY: &str = "USD";

/// Kinds of outbox intents exchanged between the booking saga and the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentType {
    PaymentRequested,
    BookingConfirmed,
    BookingCanceled,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::PaymentRequested => "PAYMENT_REQUESTED",
            IntentType::BookingConfirmed => "BOOKING_CONFIRMED",
            IntentType::BookingCanceled => "BOOKING_CANCELED",
        }
    }
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown intent type: {0}")]
pub struct UnknownIntentType(pub String);

impl FromStr for IntentType {
    type Err = UnknownIntentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PAYMENT_REQUESTED" => Ok(IntentType::PaymentRequested),
            "BOOKING_CONFIRMED" => Ok(IntentType::BookingConfirmed),
            "BOOKING_CANCELED" => Ok(IntentType::BookingCanceled),
            other => Err(UnknownIntentType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequested {
    pub booking_id: i64,
    pub client_id: i64,
    pub amount_cents: i64,
    pub currency: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub booking_id: i64,
    pub success: bool,
    pub transaction_id: Option<String>,
    pub error_message: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl PaymentResponse {
    pub fn approved(booking_id: i64, transaction_id: impl Into<String>) -> Self {
        Self {
            booking_id,
            success: true,
            transaction_id: Some(transaction_id.into()),
            error_message: None,
            processed_at: Utc::now(),
        }
    }

    pub fn declined(booking_id: i64, reason: impl Into<String>) -> Self {
        Self {
            booking_id,
            success: false,
            transaction_id: None,
            error_message: Some(reason.into()),
            processed_at: Utc::now(),
        }
    }

    /// Reason recorded on the booking when the payment did not go through.
    pub fn decline_reason(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "payment declined".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingConfirmed {
    pub booking_id: i64,
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingCanceled {
    pub booking_id: i64,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(IntentType::PaymentRequested, "PAYMENT_REQUESTED")]
    #[case(IntentType::BookingConfirmed, "BOOKING_CONFIRMED")]
    #[case(IntentType::BookingCanceled, "BOOKING_CANCELED")]
    fn intent_type_names_are_stable(#[case] kind: IntentType, #[case] name: &str) {
        assert_eq!(kind.as_str(), name);
        assert_eq!(name.parse::<IntentType>(), Ok(kind));
        assert_eq!(serde_json::to_value(kind).unwrap(), serde_json::json!(name));
    }

    #[test]
    fn unknown_intent_type_is_rejected() {
        let err = "SHIPMENT_SENT".parse::<IntentType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown intent type: SHIPMENT_SENT");
    }

    #[test]
    fn payment_request_payload_uses_snake_case_keys() {
        let request = PaymentRequested {
            booking_id: 7,
            client_id: 3,
            amount_cents: 12_000,
            currency: DEFAULT_CURRENCY.to_string(),
            requested_at: "2024-01-10T10:00:00Z".parse().unwrap(),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["booking_id"], 7);
        assert_eq!(value["amount_cents"], 12_000);
        assert_eq!(value["currency"], "USD");
    }

    #[test]
    fn declined_response_carries_reason() {
        let response = PaymentResponse::declined(4, "Payment declined by bank");
        assert!(!response.success);
        assert_eq!(response.transaction_id, None);
        assert_eq!(response.decline_reason(), "Payment declined by bank");
    }
}

use crate::domain::BookingStatus;

/// Failures surfaced by the booking core.
///
/// The HTTP layer maps each variant to a status code; the claim engine and
/// the retry helper match on `LockContended` and `ConcurrencyConflict`.
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error("{0}")]
    BusinessRule(String),

    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} was modified by another request")]
    ConcurrencyConflict { entity: &'static str, id: i64 },

    #[error("car {car_id} is locked by another booking in progress")]
    LockContended { car_id: i64 },

    #[error("booking {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl BookingError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn business_rule(message: impl Into<String>) -> Self {
        Self::BusinessRule(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_entity() {
        assert_eq!(
            BookingError::not_found("Booking", 42).to_string(),
            "Booking not found: 42"
        );
        assert_eq!(
            BookingError::LockContended { car_id: 3 }.to_string(),
            "car 3 is locked by another booking in progress"
        );
        assert_eq!(
            BookingError::InvalidTransition {
                id: 1,
                from: BookingStatus::Created,
                to: BookingStatus::Confirmed,
            }
            .to_string(),
            "booking 1 cannot move from CREATED to CONFIRMED"
        );
    }

    #[test]
    fn only_revision_mismatches_count_as_conflicts() {
        assert!(BookingError::ConcurrencyConflict {
            entity: "Booking",
            id: 1
        }
        .is_conflict());
        assert!(!BookingError::LockContended { car_id: 1 }.is_conflict());
        assert!(!BookingError::business_rule("Car is not available").is_conflict());
    }
}

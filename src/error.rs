//! Operational error taxonomy and the structured failure body returned to callers.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::db::DatabaseError;
use crate::models::AppointmentStatus;

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    SlotUnavailable,
    InvalidTransition,
    InvalidOperation,
    AlreadyCancelled,
    ExceedsBalance,
    SignatureInvalid,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::SlotUnavailable => "SLOT_UNAVAILABLE",
            ErrorKind::InvalidTransition => "INVALID_TRANSITION",
            ErrorKind::InvalidOperation => "INVALID_OPERATION",
            ErrorKind::AlreadyCancelled => "ALREADY_CANCELLED",
            ErrorKind::ExceedsBalance => "EXCEEDS_BALANCE",
            ErrorKind::SignatureInvalid => "SIGNATURE_INVALID",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClinicError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Slot unavailable: {0}")]
    SlotUnavailable(String),

    #[error("Cannot change status from {from} to {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Already cancelled: {0}")]
    AlreadyCancelled(String),

    #[error("Amount {requested} exceeds the available {available}")]
    ExceedsBalance {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Payment signature verification failed")]
    SignatureInvalid,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for ClinicError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { entity_type, id } => {
                ClinicError::NotFound(format!("{entity_type} {id}"))
            }
            other if other.is_unique_violation() => ClinicError::Conflict(
                other
                    .sqlite_message()
                    .unwrap_or("duplicate key")
                    .to_string(),
            ),
            other => ClinicError::Database(other),
        }
    }
}

impl From<rusqlite::Error> for ClinicError {
    fn from(err: rusqlite::Error) -> Self {
        ClinicError::from(DatabaseError::from(err))
    }
}

impl ClinicError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClinicError::InvalidInput(_) => ErrorKind::InvalidInput,
            ClinicError::NotFound(_) => ErrorKind::NotFound,
            ClinicError::SlotUnavailable(_) => ErrorKind::SlotUnavailable,
            ClinicError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            ClinicError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            ClinicError::AlreadyCancelled(_) => ErrorKind::AlreadyCancelled,
            ClinicError::ExceedsBalance { .. } => ErrorKind::ExceedsBalance,
            ClinicError::SignatureInvalid => ErrorKind::SignatureInvalid,
            ClinicError::Conflict(_) => ErrorKind::Conflict,
            ClinicError::Gateway(_) | ClinicError::Internal(_) | ClinicError::Database(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// HTTP-equivalent status for the error kind.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidInput => 400,
            ErrorKind::SignatureInvalid => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::SlotUnavailable | ErrorKind::Conflict => 409,
            ErrorKind::InvalidTransition
            | ErrorKind::InvalidOperation
            | ErrorKind::AlreadyCancelled
            | ErrorKind::ExceedsBalance => 422,
            ErrorKind::Internal => 500,
        }
    }

    pub fn is_operational(&self) -> bool {
        self.kind() != ErrorKind::Internal
    }

    /// Render the caller-facing body. Internal failures are logged and masked.
    pub fn to_body(&self) -> ErrorBody {
        let kind = self.kind();
        let message = if self.is_operational() {
            self.to_string()
        } else {
            tracing::error!(error = %self, "internal error");
            "An internal error occurred".to_string()
        };
        ErrorBody {
            error: ErrorDetail {
                code: kind.code(),
                message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn not_found_maps_from_database_error() {
        let err: ClinicError = DatabaseError::not_found("Invoice", "abc").into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn internal_errors_are_masked() {
        let err = ClinicError::Database(DatabaseError::LockPoisoned);
        let body = err.to_body();
        assert_eq!(body.error.code, "INTERNAL");
        assert_eq!(body.error.message, "An internal error occurred");
    }

    #[test]
    fn operational_errors_keep_their_message() {
        let err = ClinicError::ExceedsBalance {
            requested: dec!(500),
            available: dec!(200),
        };
        let json = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(json["error"]["code"], "EXCEEDS_BALANCE");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("500"));
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = ClinicError::InvalidTransition {
            from: AppointmentStatus::Scheduled,
            to: AppointmentStatus::Completed,
        };
        assert_eq!(
            err.to_string(),
            "Cannot change status from scheduled to completed"
        );
        assert_eq!(err.status_code(), 422);
    }
}

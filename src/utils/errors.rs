#![forbid(unsafe_code)]

use poem_openapi::Object;
use thiserror::Error;

// ***************************************************************************
//                             Startup Errors
// ***************************************************************************
/// Errors raised during server initialization, before the engine is up.
#[derive(Error, Debug)]
pub enum Errors {
    /// Input parameter logging.
    #[error("sbs_server input parameters:\n{}", .0)]
    InputParms(String),

    /// Represents all other cases of `std::io::Error`.
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    /// Inaccessible logger configuration file.
    #[error("Unable to access the Log4rs configuration file: {}", .0)]
    Log4rsInitialization(String),

    #[error("Reading application configuration file: {}", .0)]
    ReadingConfigFile(String),

    #[error("Unable to parse TOML file: {}", .0)]
    TOMLParseError(String),

    #[error("SBS Error: {}", .0)]
    SBSError(String),
}

// ***************************************************************************
//                              Engine Errors
// ***************************************************************************
/// The typed errors surfaced by the reservation engine and its adapters.
/// The API layer maps each variant to a protocol response; codes are stable
/// strings that clients can dispatch on.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Input malformed or missing.
    #[error("VALIDATION_ERROR: {}", .0)]
    Validation(String),

    /// Missing or invalid tenant or user identity.
    #[error("AUTHENTICATION_ERROR: {}", .0)]
    Authentication(String),

    /// Origin not permitted or tenant disabled.
    #[error("AUTHORIZATION_ERROR: {}", .0)]
    Authorization(String),

    /// Referenced seat/reservation/booking absent.
    #[error("NOT_FOUND: {}", .0)]
    NotFound(String),

    /// Invariant violation: seat not available, reservation not ACTIVE,
    /// wrong owner.  The optional details carry machine-readable context
    /// such as the current reservation status or an existing booking id.
    #[error("CONFLICT: {}", .0)]
    Conflict(String, Option<String>),

    /// A concurrent holder owns the seat lock, or lock verification failed.
    /// Callers may retry once `expires_in` seconds have elapsed.
    #[error("SEAT_LOCKED: seat is held by another request, retry in {} seconds", .expires_in)]
    SeatLock { expires_in: i64 },

    /// Payment reference invalid, gateway verification failed, or bad
    /// callback signature.
    #[error("PAYMENT_ERROR: {}", .0)]
    Payment(String),

    /// Underlying store I/O failure; retriable.
    #[error("STORE_UNAVAILABLE: {}", .0)]
    StoreUnavailable(String),
}

impl EngineError {
    /// A conflict without extra details.
    pub fn conflict(msg: impl Into<String>) -> Self {
        EngineError::Conflict(msg.into(), None)
    }

    /// The stable error code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::Authentication(_) => "AUTHENTICATION_ERROR",
            EngineError::Authorization(_) => "AUTHORIZATION_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Conflict(..) => "CONFLICT",
            EngineError::SeatLock { .. } => "SEAT_LOCKED",
            EngineError::Payment(_) => "PAYMENT_ERROR",
            EngineError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }

    /// The HTTP status the API surface uses for this variant.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::Authentication(_) => 401,
            EngineError::Payment(_) => 402,
            EngineError::Authorization(_) => 403,
            EngineError::NotFound(_) => 404,
            EngineError::Conflict(..) => 409,
            EngineError::SeatLock { .. } => 423,
            EngineError::StoreUnavailable(_) => 503,
        }
    }

    /// Machine-readable details attached to the error, if any.
    pub fn details(&self) -> Option<String> {
        match self {
            EngineError::Conflict(_, details) => details.clone(),
            EngineError::SeatLock { expires_in } => Some(format!("expires_in={}", expires_in)),
            _ => None,
        }
    }
}

// Adapter errors that are not recognized elsewhere wrap as StoreUnavailable.
impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::StoreUnavailable(format!("database: {}", e))
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::StoreUnavailable(format!("lock store: {}", e))
    }
}

// ***************************************************************************
//                             HTTP Error Body
// ***************************************************************************
/// The uniform error payload returned by every endpoint.
#[derive(Object, Debug)]
pub struct HttpResult {
    pub result_code: String,
    pub result_msg: String,
    pub details: Option<String>,
}

impl HttpResult {
    pub fn new(result_code: String, result_msg: String) -> Self {
        Self { result_code, result_msg, details: None }
    }

    /// Build the payload straight from an engine error.
    pub fn from_engine_error(error: &EngineError) -> Self {
        Self {
            result_code: error.code().to_string(),
            result_msg: error.to_string(),
            details: error.details(),
        }
    }
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(EngineError::Validation("x".into()).http_status(), 400);
        assert_eq!(EngineError::Authentication("x".into()).http_status(), 401);
        assert_eq!(EngineError::Payment("x".into()).http_status(), 402);
        assert_eq!(EngineError::Authorization("x".into()).http_status(), 403);
        assert_eq!(EngineError::NotFound("x".into()).http_status(), 404);
        assert_eq!(EngineError::conflict("x").http_status(), 409);
        assert_eq!(EngineError::SeatLock { expires_in: 9 }.http_status(), 423);
        assert_eq!(EngineError::StoreUnavailable("x".into()).http_status(), 503);
    }

    #[test]
    fn seat_lock_details_carry_ttl() {
        let e = EngineError::SeatLock { expires_in: 42 };
        assert_eq!(e.details().as_deref(), Some("expires_in=42"));
        let body = HttpResult::from_engine_error(&e);
        assert_eq!(body.result_code, "SEAT_LOCKED");
    }
}

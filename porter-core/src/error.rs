use thiserror::Error;

/// Gateway error taxonomy.
///
/// Every failure that can cross the RPC boundary maps onto exactly one of
/// these variants; the service layer translates the variant into a gRPC
/// status with a stable kind prefix in the detail string.
#[derive(Debug, Error)]
pub enum PorterError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    #[error("query failed: {0}")]
    QueryFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("connection acquire timed out")]
    AcquireTimeout,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("ticket expired")]
    TicketExpired,
    #[error("operation cancelled")]
    Cancelled,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
}

impl PorterError {
    /// Stable textual kind carried in the status detail on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            PorterError::InvalidArgument(_) => "INVALID_ARGUMENT",
            PorterError::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            PorterError::QueryFailed(_) => "QUERY_FAILED",
            PorterError::Internal(_) | PorterError::Arrow(_) => "INTERNAL",
            PorterError::AcquireTimeout => "ACQUIRE_TIMEOUT",
            PorterError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            PorterError::TicketExpired => "TICKET_EXPIRED",
            PorterError::Cancelled => "CANCELLED",
            PorterError::Unavailable(_) => "UNAVAILABLE",
            PorterError::Unauthenticated(_) => "UNAUTHENTICATED",
            PorterError::PermissionDenied(_) => "PERMISSION_DENIED",
        }
    }
}

impl From<duckdb::Error> for PorterError {
    fn from(err: duckdb::Error) -> Self {
        PorterError::QueryFailed(err.to_string())
    }
}

impl From<reqwest::Error> for PorterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            PorterError::Unavailable(err.to_string())
        } else {
            PorterError::QueryFailed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        assert_eq!(
            PorterError::InvalidArgument("x".into()).kind(),
            "INVALID_ARGUMENT"
        );
        assert_eq!(PorterError::AcquireTimeout.kind(), "ACQUIRE_TIMEOUT");
        assert_eq!(PorterError::TicketExpired.kind(), "TICKET_EXPIRED");
        assert_eq!(
            PorterError::Arrow(arrow_schema::ArrowError::ParseError("bad".into())).kind(),
            "INTERNAL"
        );
    }

    #[test]
    fn duckdb_errors_surface_as_query_failures() {
        let conn = duckdb::Connection::open_in_memory().expect("open in-memory duckdb");
        let err = conn
            .execute_batch("SELECT * FROM __missing_table__")
            .expect_err("query against missing table");
        let mapped = PorterError::from(err);
        assert_eq!(mapped.kind(), "QUERY_FAILED");
    }
}

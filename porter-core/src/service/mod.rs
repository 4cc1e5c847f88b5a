//! Flight SQL dispatcher.
//!
//! Decodes protocol messages, routes them to backend operations through
//! the pool, and streams record batches back. All statement and
//! transaction state lives in `GatewayState`; handlers are free
//! functions grouped by protocol area under `handlers/`.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use arrow_flight::FlightData;
use futures::{stream, Stream};
use tonic::{Request, Status};
use tracing::{error, Span};
use uuid::Uuid;

use crate::auth::{Principal, Verifier};
use crate::error::PorterError;

mod convert;
mod handlers;
pub mod state;
mod stream_query;

pub use state::GatewayState;

#[derive(Clone)]
pub struct PorterFlightSqlService {
    state: Arc<GatewayState>,
    verifier: Arc<dyn Verifier>,
}

impl PorterFlightSqlService {
    pub fn new(state: Arc<GatewayState>, verifier: Arc<dyn Verifier>) -> Self {
        Self { state, verifier }
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Spawn the background reaper for idle statements and expired
    /// one-shot tickets.
    pub fn spawn_reaper(state: Arc<GatewayState>, period: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let reaped = state.reap_idle_statements();
                if reaped > 0 {
                    tracing::info!(reaped, "released idle statements");
                }
            }
        });
    }

    /// Verify identity and stamp the request's correlation id onto the
    /// current span.
    pub(crate) fn prepare_request<T>(
        &self,
        request: &Request<T>,
    ) -> Result<Principal, Status> {
        let correlation_id = Uuid::new_v4();
        Span::current().record("correlation_id", correlation_id.to_string().as_str());
        let principal = self
            .verifier
            .verify(request.metadata())
            .map_err(Self::status_from_error)?;
        Span::current().record("principal", principal.name.as_str());
        Ok(principal)
    }

    /// Map a core error onto the wire status; the stable kind prefix
    /// rides in the detail message.
    pub(crate) fn status_from_error(err: PorterError) -> Status {
        let detail = format!("{}: {err}", err.kind());
        match &err {
            PorterError::InvalidArgument(_) => Status::invalid_argument(detail),
            PorterError::UnsupportedType(_) => Status::unimplemented(detail),
            PorterError::QueryFailed(_) => Status::internal(detail),
            PorterError::Internal(_) | PorterError::Arrow(_) => {
                error!(error = %err, "internal error");
                Status::internal(detail)
            }
            PorterError::AcquireTimeout => Status::resource_exhausted(detail),
            PorterError::DeadlineExceeded => Status::deadline_exceeded(detail),
            PorterError::TicketExpired => Status::failed_precondition(detail),
            PorterError::Cancelled => Status::cancelled(detail),
            PorterError::Unavailable(_) => Status::unavailable(detail),
            PorterError::Unauthenticated(_) => Status::unauthenticated(detail),
            PorterError::PermissionDenied(_) => Status::permission_denied(detail),
        }
    }

    pub(crate) fn status_from_join(err: tokio::task::JoinError) -> Status {
        if err.is_panic() {
            error!(%err, "blocking task panicked");
            Status::internal("blocking task panicked")
        } else {
            error!(%err, "blocking task cancelled");
            Status::internal(format!("blocking task cancelled: {err}"))
        }
    }

    pub(crate) fn into_stream(
        batches: Vec<FlightData>,
    ) -> Pin<Box<dyn Stream<Item = Result<FlightData, Status>> + Send + 'static>> {
        Box::pin(stream::iter(batches.into_iter().map(Ok)))
    }

    /// Detect if SQL is a query (returns results) or a statement.
    pub(crate) fn is_query_statement(sql: &str) -> bool {
        let trimmed = sql.trim_start();

        let mut cleaned = trimmed;
        loop {
            if let Some(rest) = cleaned.strip_prefix("--") {
                if let Some(newline_pos) = rest.find('\n') {
                    cleaned = rest[newline_pos + 1..].trim_start();
                } else {
                    return false;
                }
            } else if let Some(rest) = cleaned.strip_prefix("/*") {
                if let Some(end_pos) = rest.find("*/") {
                    cleaned = rest[end_pos + 2..].trim_start();
                } else {
                    return false;
                }
            } else {
                break;
            }
        }

        let first_word = cleaned
            .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
            .find(|w| !w.is_empty())
            .unwrap_or("")
            .to_uppercase();

        matches!(
            first_word.as_str(),
            "SELECT" | "WITH" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "VALUES" | "TABLE"
        )
    }
}

#[cfg(test)]
mod tests {
    use tonic::Code;

    use super::*;

    #[test]
    fn status_mapping_is_stable_per_kind() {
        let cases = [
            (
                PorterError::InvalidArgument("bad".into()),
                Code::InvalidArgument,
                "INVALID_ARGUMENT",
            ),
            (
                PorterError::UnsupportedType("GEOMETRY".into()),
                Code::Unimplemented,
                "UNSUPPORTED_TYPE",
            ),
            (
                PorterError::QueryFailed("boom".into()),
                Code::Internal,
                "QUERY_FAILED",
            ),
            (PorterError::AcquireTimeout, Code::ResourceExhausted, "ACQUIRE_TIMEOUT"),
            (PorterError::DeadlineExceeded, Code::DeadlineExceeded, "DEADLINE_EXCEEDED"),
            (PorterError::TicketExpired, Code::FailedPrecondition, "TICKET_EXPIRED"),
            (PorterError::Cancelled, Code::Cancelled, "CANCELLED"),
            (
                PorterError::Unavailable("down".into()),
                Code::Unavailable,
                "UNAVAILABLE",
            ),
            (
                PorterError::Unauthenticated("who".into()),
                Code::Unauthenticated,
                "UNAUTHENTICATED",
            ),
            (
                PorterError::PermissionDenied("no".into()),
                Code::PermissionDenied,
                "PERMISSION_DENIED",
            ),
        ];
        for (err, code, prefix) in cases {
            let status = PorterFlightSqlService::status_from_error(err);
            assert_eq!(status.code(), code);
            assert!(
                status.message().starts_with(prefix),
                "{} should start with {prefix}",
                status.message()
            );
        }
    }

    #[test]
    fn query_detection_skips_comments() {
        assert!(PorterFlightSqlService::is_query_statement("SELECT 1"));
        assert!(PorterFlightSqlService::is_query_statement(
            "-- leading comment\nWITH t AS (SELECT 1) SELECT * FROM t"
        ));
        assert!(PorterFlightSqlService::is_query_statement(
            "/* block */ EXPLAIN SELECT 1"
        ));
        assert!(!PorterFlightSqlService::is_query_statement(
            "INSERT INTO t VALUES (1)"
        ));
        assert!(!PorterFlightSqlService::is_query_statement("-- only comment"));
    }

    #[test]
    fn into_stream_yields_all_batches() {
        let mut stream = PorterFlightSqlService::into_stream(vec![
            FlightData::default(),
            FlightData::default(),
        ]);
        let emitted = futures::executor::block_on(async {
            use futures::StreamExt;
            let mut count = 0usize;
            while let Some(item) = stream.next().await {
                assert!(item.is_ok());
                count += 1;
            }
            count
        });
        assert_eq!(emitted, 2);
    }
}

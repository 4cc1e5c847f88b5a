//! DoGet streaming: cursor → batch reader → flight data.
//!
//! The producer runs on the blocking pool and pushes batches through a
//! bounded channel; it only advances the reader once the transport has
//! drained the previous send, so a slow client never forces buffering.
//! When the client disconnects the receiver drops, the next send fails,
//! and the producer tears down in order: reader released (closing the
//! cursor), then the handle returned.

use std::sync::Arc;
use std::time::Instant;

use arrow_array::RecordBatch;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::FlightData;
use arrow_schema::SchemaRef;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tracing::{debug, warn};

use crate::convert::BatchReader;
use crate::error::PorterError;
use crate::pool::PooledConn;
use crate::service::state::GatewayState;
use crate::service::PorterFlightSqlService;
use crate::types::CellValue;

/// Batches buffered between producer and transport. One in flight, one
/// being encoded.
const STREAM_CREDIT: usize = 2;

pub(crate) struct StreamRequest {
    pub sql: String,
    pub params: Vec<CellValue>,
    pub schema: SchemaRef,
    /// Statement to hand the connection back to when the stream ends;
    /// `None` drops the handle back into the pool.
    pub return_to: Option<u64>,
    pub conn: PooledConn,
}

pub(crate) type DoGetStream = BoxStream<'static, Result<FlightData, Status>>;

/// Run the query on the blocking pool and stream its batches.
pub(crate) fn stream_query(state: Arc<GatewayState>, request: StreamRequest) -> DoGetStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<RecordBatch, PorterError>>(STREAM_CREDIT);
    let schema = request.schema.clone();

    tokio::task::spawn_blocking(move || produce(state, request, tx));

    let batches = ReceiverStream::new(rx).map(|item| {
        item.map_err(|err| {
            FlightError::Tonic(Box::new(PorterFlightSqlService::status_from_error(err)))
        })
    });
    FlightDataEncoderBuilder::new()
        .with_schema(schema)
        .build(batches)
        .map(|item| {
            item.map_err(|err| match err {
                FlightError::Tonic(status) => *status,
                other => Status::internal(format!("flight encode error: {other}")),
            })
        })
        .boxed()
}

fn produce(
    state: Arc<GatewayState>,
    request: StreamRequest,
    tx: tokio::sync::mpsc::Sender<Result<RecordBatch, PorterError>>,
) {
    let StreamRequest {
        sql,
        params,
        schema,
        return_to,
        mut conn,
    } = request;
    let kind = state.backend_kind;
    let started = Instant::now();
    state.metrics.query_started(kind);

    let outcome = run_cursor(&state, &sql, &params, schema, &mut conn, &started, &tx);

    match outcome {
        Ok(()) => state.metrics.query_completed(kind, started.elapsed()),
        Err(err) => {
            state.metrics.query_failed(kind);
            if matches!(err, PorterError::Unavailable(_)) {
                conn.mark_broken();
            }
            // The receiver may already be gone on cancellation.
            let _ = tx.blocking_send(Err(err));
        }
    }

    match return_to {
        Some(id) => state.return_statement_conn(id, conn),
        None => drop(conn),
    }
    state.metrics.record_cache_stats(state.cache.stats());
}

fn run_cursor(
    state: &GatewayState,
    sql: &str,
    params: &[CellValue],
    schema: SchemaRef,
    conn: &mut PooledConn,
    started: &Instant,
    tx: &tokio::sync::mpsc::Sender<Result<RecordBatch, PorterError>>,
) -> Result<(), PorterError> {
    let cursor = conn.query(sql, params)?;
    let mut reader = BatchReader::new_with_schema(schema, cursor);
    reader.set_batch_size(state.batch_size);

    loop {
        if let Some(deadline) = state.query_deadline {
            if started.elapsed() > deadline {
                reader.release();
                return Err(PorterError::DeadlineExceeded);
            }
        }
        if !reader.advance() {
            break;
        }
        let batch = reader
            .current()
            .ok_or_else(|| PorterError::Internal("advance returned true without a batch".into()))?;
        state
            .metrics
            .batch_emitted(batch.num_rows(), batch.get_array_memory_size());
        if tx.blocking_send(Ok(batch)).is_err() {
            debug!("client went away mid-stream, cancelling cursor");
            reader.release();
            return Ok(());
        }
    }

    let trailing = reader.take_error();
    reader.release();
    match trailing {
        Some(err) => {
            warn!(%err, "cursor ended with error");
            Err(err)
        }
        None => Ok(()),
    }
}

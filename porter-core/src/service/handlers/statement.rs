use std::sync::Arc;
use std::time::Instant;

use arrow_flight::flight_service_server::FlightService;
use arrow_flight::sql::server::PeekableFlightDataStream;
use arrow_flight::sql::{
    CommandStatementIngest, CommandStatementQuery, CommandStatementUpdate, ProstMessageExt,
    TicketStatementQuery,
};
use arrow_flight::{FlightDescriptor, FlightEndpoint, FlightInfo, Ticket};
use arrow_schema::SchemaRef;
use prost::Message;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::cache::{CacheEntry, Fingerprint};
use crate::error::PorterError;
use crate::service::state::{decode_handle, GatewayState, StatementEntry};
use crate::service::stream_query::{stream_query, StreamRequest};
use crate::service::PorterFlightSqlService;
use crate::ticket::TicketKind;
use crate::types::{schema_from_columns, CellValue};

pub(crate) async fn get_flight_info_statement(
    service: &PorterFlightSqlService,
    query: CommandStatementQuery,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    service.prepare_request(&request)?;
    if !PorterFlightSqlService::is_query_statement(&query.query) {
        return Err(Status::invalid_argument(
            "statement does not return a result set; use DoPut",
        ));
    }

    let state = Arc::clone(service.state());
    let sql = query.query.clone();
    let (statement_id, schema_id, schema) = tokio::task::spawn_blocking(move || {
        describe_and_register(&state, sql)
    })
    .await
    .map_err(PorterFlightSqlService::status_from_join)?
    .map_err(PorterFlightSqlService::status_from_error)?;

    debug!(statement_id, field_count = schema.fields().len(), "planned schema");

    let payload = service
        .state()
        .issuer
        .issue(TicketKind::Statement, statement_id, schema_id);
    let ticket = TicketStatementQuery {
        statement_handle: payload.into(),
    };
    let endpoint =
        FlightEndpoint::new().with_ticket(Ticket::new(ticket.as_any().encode_to_vec()));

    let descriptor = request.into_inner();
    let info = FlightInfo::new()
        .try_with_schema(schema.as_ref())
        .map_err(|err| Status::internal(format!("failed to encode schema: {err}")))?
        .with_descriptor(descriptor)
        .with_endpoint(endpoint)
        .with_total_records(-1);

    Ok(Response::new(info))
}

/// Resolve the schema (cache-first), then reserve a handle and register
/// the one-shot statement the ticket will redeem. Schema inference
/// failures happen before any ticket exists.
fn describe_and_register(
    state: &Arc<GatewayState>,
    sql: String,
) -> Result<(u64, u64, SchemaRef), PorterError> {
    let mut conn = state.acquire_timed()?;
    let fp = Fingerprint::compute(&sql, &state.backend_identity, &[]);
    let entry = state.cache.get_or_build(&fp, || {
        let cols = conn.describe_columns(&sql)?;
        let schema = schema_from_columns(&cols)?;
        Ok(CacheEntry::schema_only(SchemaRef::new(schema)))
    })?;
    state.metrics.record_cache_stats(state.cache.stats());

    let schema = Arc::clone(&entry.schema);
    let schema_id = fp.short_id();
    let statement_id = state.register_statement(StatementEntry {
        sql,
        is_query: true,
        kind: TicketKind::Statement,
        schema: Some(Arc::clone(&schema)),
        schema_id,
        pending_params: None,
        conn: Some(conn),
        last_used: Instant::now(),
    });
    Ok((statement_id, schema_id, schema))
}

pub(crate) async fn do_get_statement(
    service: &PorterFlightSqlService,
    ticket: TicketStatementQuery,
    request: Request<Ticket>,
) -> Result<Response<<PorterFlightSqlService as FlightService>::DoGetStream>, Status> {
    service.prepare_request(&request)?;
    let state = Arc::clone(service.state());

    let payload = match state.issuer.verify(&ticket.statement_handle) {
        Ok(payload) => payload,
        Err(err) => {
            if matches!(err, PorterError::TicketExpired) {
                state.metrics.ticket_expired();
            }
            return Err(PorterFlightSqlService::status_from_error(err));
        }
    };

    let statement_id = payload.statement_id;
    let meta = state
        .statement_meta(statement_id)
        .map_err(PorterFlightSqlService::status_from_error)?;
    if meta.schema_id != payload.schema_id {
        return Err(PorterFlightSqlService::status_from_error(
            PorterError::InvalidArgument("ticket does not match the registered statement".into()),
        ));
    }
    if !meta.is_query {
        return Err(Status::invalid_argument(
            "statement does not return a result set",
        ));
    }
    let schema = meta
        .schema
        .clone()
        .ok_or_else(|| Status::internal("statement registered without a schema"))?;

    let params = state
        .take_statement_params(statement_id)
        .map_err(PorterFlightSqlService::status_from_error)?;

    // One-shot statements are consumed by their DoGet; prepared
    // statements stay registered and get their handle back afterwards.
    let (conn, return_to) = match meta.kind {
        TicketKind::Statement => {
            let mut entry = state
                .remove_statement(statement_id)
                .map_err(PorterFlightSqlService::status_from_error)?;
            let conn = match entry.conn.take() {
                Some(conn) => conn,
                None => state
                    .acquire_timed()
                    .map_err(PorterFlightSqlService::status_from_error)?,
            };
            (conn, None)
        }
        TicketKind::Prepared => {
            let conn = state
                .take_statement_conn(statement_id)
                .map_err(PorterFlightSqlService::status_from_error)?;
            (conn, Some(statement_id))
        }
    };

    info!(statement_id, sql = %meta.sql, "streaming query results");

    let stream = stream_query(
        state,
        StreamRequest {
            sql: meta.sql,
            params,
            schema,
            return_to,
            conn,
        },
    );
    Ok(Response::new(stream))
}

pub(crate) async fn do_put_statement_update(
    service: &PorterFlightSqlService,
    command: CommandStatementUpdate,
    request: Request<PeekableFlightDataStream>,
) -> Result<i64, Status> {
    service.prepare_request(&request)?;
    let state = Arc::clone(service.state());
    let sql = command.query.clone();
    let txn = decode_transaction(command.transaction_id.as_deref())?;

    let affected = tokio::task::spawn_blocking(move || {
        execute_update(&state, &sql, &[], txn)
    })
    .await
    .map_err(PorterFlightSqlService::status_from_join)?
    .map_err(PorterFlightSqlService::status_from_error)?;

    info!(affected, "statement update complete");
    Ok(affected)
}

pub(crate) async fn do_put_statement_ingest(
    service: &PorterFlightSqlService,
    command: CommandStatementIngest,
    request: Request<PeekableFlightDataStream>,
) -> Result<i64, Status> {
    service.prepare_request(&request)?;
    let state = Arc::clone(service.state());
    let table = command.table.clone();
    let txn = decode_transaction(command.transaction_id.as_deref())?;

    let batches = PorterFlightSqlService::collect_batches(request).await?;
    let total_rows: i64 = batches.iter().map(|b| b.num_rows() as i64).sum();

    let written = tokio::task::spawn_blocking(move || match txn {
        Some(txn_id) => {
            let mut conn = state.take_transaction_conn(txn_id)?;
            let result = conn.ingest(&table, &batches);
            state.return_transaction_conn(txn_id, conn);
            result
        }
        None => {
            let mut conn = state.acquire_timed()?;
            conn.ingest(&table, &batches)
        }
    })
    .await
    .map_err(PorterFlightSqlService::status_from_join)?
    .map_err(PorterFlightSqlService::status_from_error)?;

    service.state().metrics.rows_ingested(written as u64);
    info!(rows = written, expected = total_rows, "bulk ingest complete");
    Ok(written)
}

/// Run one update, routed onto the transaction's pinned handle when a
/// transaction id is attached.
pub(crate) fn execute_update(
    state: &Arc<GatewayState>,
    sql: &str,
    params: &[CellValue],
    txn: Option<u64>,
) -> Result<i64, PorterError> {
    let started = Instant::now();
    state.metrics.query_started(state.backend_kind);
    let result = match txn {
        Some(txn_id) => {
            let mut conn = state.take_transaction_conn(txn_id)?;
            let result = conn.execute(sql, params);
            state.return_transaction_conn(txn_id, conn);
            result
        }
        None => {
            let mut conn = state.acquire_timed()?;
            conn.execute(sql, params)
        }
    };
    match &result {
        Ok(_) => state
            .metrics
            .query_completed(state.backend_kind, started.elapsed()),
        Err(_) => state.metrics.query_failed(state.backend_kind),
    }
    result
}

pub(crate) fn decode_transaction(bytes: Option<&[u8]>) -> Result<Option<u64>, Status> {
    match bytes {
        None => Ok(None),
        Some(bytes) if bytes.is_empty() => Ok(None),
        Some(bytes) => decode_handle(bytes)
            .map(Some)
            .map_err(PorterFlightSqlService::status_from_error),
    }
}

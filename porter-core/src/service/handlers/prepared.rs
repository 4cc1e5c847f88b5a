use std::sync::Arc;
use std::time::Instant;

use arrow_flight::flight_service_server::FlightService;
use arrow_flight::sql::server::PeekableFlightDataStream;
use arrow_flight::sql::{
    ActionClosePreparedStatementRequest, ActionCreatePreparedStatementRequest,
    ActionCreatePreparedStatementResult, CommandPreparedStatementQuery,
    CommandPreparedStatementUpdate, DoPutPreparedStatementResult, ProstMessageExt,
    TicketStatementQuery,
};
use arrow_flight::{FlightDescriptor, FlightEndpoint, FlightInfo, Ticket};
use arrow_schema::SchemaRef;
use prost::Message;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::cache::{CacheEntry, Fingerprint};
use crate::error::PorterError;
use crate::service::state::{decode_handle, encode_handle, GatewayState, StatementEntry};
use crate::service::stream_query::{stream_query, StreamRequest};
use crate::service::PorterFlightSqlService;
use crate::ticket::TicketKind;
use crate::types::schema_from_columns;

fn parse_handle(bytes: &[u8]) -> Result<u64, Status> {
    decode_handle(bytes).map_err(PorterFlightSqlService::status_from_error)
}

pub(crate) async fn do_action_create_prepared_statement(
    service: &PorterFlightSqlService,
    query: ActionCreatePreparedStatementRequest,
    request: Request<arrow_flight::Action>,
) -> Result<ActionCreatePreparedStatementResult, Status> {
    service.prepare_request(&request)?;
    let sql = query.query.clone();
    let is_query = PorterFlightSqlService::is_query_statement(&sql);
    let state = Arc::clone(service.state());

    let (statement_id, dataset_schema) = tokio::task::spawn_blocking(move || {
        let mut conn = state.acquire_timed()?;
        let fp = Fingerprint::compute(&sql, &state.backend_identity, &[]);
        let (schema, schema_bytes) = if is_query {
            let entry = state.cache.get_or_build(&fp, || {
                let cols = conn.describe_columns(&sql)?;
                let schema = schema_from_columns(&cols)?;
                Ok(CacheEntry::schema_only(SchemaRef::new(schema)))
            })?;
            state.metrics.record_cache_stats(state.cache.stats());
            let bytes = PorterFlightSqlService::schema_to_ipc_bytes(&entry.schema)?;
            (Some(Arc::clone(&entry.schema)), bytes)
        } else {
            (None, Vec::new())
        };

        let statement_id = state.register_statement(StatementEntry {
            sql,
            is_query,
            kind: TicketKind::Prepared,
            schema,
            schema_id: fp.short_id(),
            pending_params: None,
            conn: Some(conn),
            last_used: Instant::now(),
        });
        Ok::<_, PorterError>((statement_id, schema_bytes))
    })
    .await
    .map_err(PorterFlightSqlService::status_from_join)?
    .map_err(PorterFlightSqlService::status_from_error)?;

    info!(statement_id, is_query, "prepared statement created");

    Ok(ActionCreatePreparedStatementResult {
        prepared_statement_handle: encode_handle(statement_id).into(),
        dataset_schema: dataset_schema.into(),
        parameter_schema: Vec::<u8>::new().into(),
    })
}

pub(crate) async fn get_flight_info_prepared_statement(
    service: &PorterFlightSqlService,
    query: CommandPreparedStatementQuery,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    service.prepare_request(&request)?;
    let statement_id = parse_handle(query.prepared_statement_handle.as_ref())?;
    let state = Arc::clone(service.state());

    let (schema, schema_id) = ensure_schema(&state, statement_id)
        .await
        .map_err(PorterFlightSqlService::status_from_error)?;

    debug!(
        statement_id,
        field_count = schema.fields().len(),
        "prepared statement schema resolved"
    );

    let payload = service
        .state()
        .issuer
        .issue(TicketKind::Prepared, statement_id, schema_id);
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

/// Resolve the prepared statement's output schema, describing through
/// its reserved handle on first use.
async fn ensure_schema(
    state: &Arc<GatewayState>,
    statement_id: u64,
) -> Result<(SchemaRef, u64), PorterError> {
    let meta = state.statement_meta(statement_id)?;
    if !meta.is_query {
        return Err(PorterError::InvalidArgument(
            "prepared statement does not return a result set".into(),
        ));
    }
    if let Some(schema) = meta.schema {
        return Ok((schema, meta.schema_id));
    }

    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || {
        let mut conn = state.take_statement_conn(statement_id)?;
        let described = conn
            .describe_columns(&meta.sql)
            .and_then(|cols| schema_from_columns(&cols));
        state.return_statement_conn(statement_id, conn);
        let schema = SchemaRef::new(described?);
        state.cache_statement_schema(statement_id, Arc::clone(&schema));
        Ok((schema, meta.schema_id))
    })
    .await
    .map_err(|err| PorterError::Internal(format!("blocking task failed: {err}")))?
}

pub(crate) async fn do_get_prepared_statement(
    service: &PorterFlightSqlService,
    query: CommandPreparedStatementQuery,
    request: Request<Ticket>,
) -> Result<Response<<PorterFlightSqlService as FlightService>::DoGetStream>, Status> {
    service.prepare_request(&request)?;
    let statement_id = parse_handle(query.prepared_statement_handle.as_ref())?;
    let state = Arc::clone(service.state());

    let (schema, _) = ensure_schema(&state, statement_id)
        .await
        .map_err(PorterFlightSqlService::status_from_error)?;
    let meta = state
        .statement_meta(statement_id)
        .map_err(PorterFlightSqlService::status_from_error)?;
    let params = state
        .take_statement_params(statement_id)
        .map_err(PorterFlightSqlService::status_from_error)?;
    let conn = state
        .take_statement_conn(statement_id)
        .map_err(PorterFlightSqlService::status_from_error)?;

    info!(statement_id, sql = %meta.sql, "executing prepared statement");

    let stream = stream_query(
        state,
        StreamRequest {
            sql: meta.sql,
            params,
            schema,
            return_to: Some(statement_id),
            conn,
        },
    );
    Ok(Response::new(stream))
}

pub(crate) async fn do_put_prepared_statement_query(
    service: &PorterFlightSqlService,
    query: CommandPreparedStatementQuery,
    request: Request<PeekableFlightDataStream>,
) -> Result<DoPutPreparedStatementResult, Status> {
    service.prepare_request(&request)?;
    let statement_id = parse_handle(query.prepared_statement_handle.as_ref())?;
    let state = Arc::clone(service.state());

    let meta = state
        .statement_meta(statement_id)
        .map_err(PorterFlightSqlService::status_from_error)?;
    if !meta.is_query {
        return Err(Status::invalid_argument(
            "prepared statement does not support query binding",
        ));
    }

    let parameter_sets = PorterFlightSqlService::collect_parameter_sets(request).await?;
    if let Some(first) = parameter_sets.into_iter().next() {
        state
            .set_statement_params(statement_id, first)
            .map_err(PorterFlightSqlService::status_from_error)?;
    }

    info!(statement_id, "parameters bound to prepared statement");
    Ok(DoPutPreparedStatementResult::default())
}

pub(crate) async fn do_put_prepared_statement_update(
    service: &PorterFlightSqlService,
    query: CommandPreparedStatementUpdate,
    request: Request<PeekableFlightDataStream>,
) -> Result<i64, Status> {
    service.prepare_request(&request)?;
    let statement_id = parse_handle(query.prepared_statement_handle.as_ref())?;
    let state = Arc::clone(service.state());

    let meta = state
        .statement_meta(statement_id)
        .map_err(PorterFlightSqlService::status_from_error)?;
    if meta.is_query {
        return Err(Status::invalid_argument(
            "prepared statement returns rows; use DoGet",
        ));
    }

    let parameter_sets = PorterFlightSqlService::collect_parameter_sets(request).await?;
    let set_count = parameter_sets.len();

    // Updates run on the statement's reserved handle so they observe any
    // session state it carries.
    let affected = tokio::task::spawn_blocking(move || {
        let mut conn = state.take_statement_conn(statement_id)?;
        let mut total = 0i64;
        let mut failure = None;
        for params in &parameter_sets {
            match conn.execute(&meta.sql, params) {
                Ok(affected) => total += affected,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        state.return_statement_conn(statement_id, conn);
        match failure {
            Some(err) => Err(err),
            None => Ok(total),
        }
    })
    .await
    .map_err(PorterFlightSqlService::status_from_join)?
    .map_err(PorterFlightSqlService::status_from_error)?;

    info!(
        statement_id,
        affected,
        parameter_sets = set_count,
        "prepared statement update complete"
    );
    Ok(affected)
}

pub(crate) async fn do_action_close_prepared_statement(
    service: &PorterFlightSqlService,
    query: ActionClosePreparedStatementRequest,
    request: Request<arrow_flight::Action>,
) -> Result<(), Status> {
    service.prepare_request(&request)?;
    let statement_id = parse_handle(query.prepared_statement_handle.as_ref())?;
    service
        .state()
        .remove_statement(statement_id)
        .map_err(PorterFlightSqlService::status_from_error)?;
    info!(statement_id, "prepared statement closed");
    Ok(())
}

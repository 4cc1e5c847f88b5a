use std::sync::Arc;

use arrow_array::{ArrayRef, Int32Array, RecordBatch, StringArray, UInt8Array};
use arrow_flight::flight_service_server::FlightService;
use arrow_flight::sql::{
    CommandGetCatalogs, CommandGetDbSchemas, CommandGetExportedKeys, CommandGetImportedKeys,
    CommandGetPrimaryKeys, CommandGetTableTypes, CommandGetTables, ProstMessageExt,
};
use arrow_flight::{FlightDescriptor, FlightEndpoint, FlightInfo, Ticket};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use prost::Message;
use tonic::{Request, Response, Status};
use tracing::{error, warn};

use crate::cache::{CacheEntry, Fingerprint};
use crate::error::PorterError;
use crate::service::state::GatewayState;
use crate::service::PorterFlightSqlService;
use crate::types::{map_column, schema_from_columns, CellValue, ScanSlot};

const SCHEMAS_SQL: &str = "SELECT \
    catalog_name AS catalog_name, \
    schema_name AS schema_name \
    FROM information_schema.schemata \
    WHERE schema_name NOT IN ('information_schema', 'pg_catalog')";

const TABLES_SQL: &str = "SELECT \
    table_catalog AS table_catalog, \
    table_schema AS table_schema, \
    table_name AS table_name, \
    table_type AS table_type \
    FROM information_schema.tables \
    WHERE table_schema NOT IN ('information_schema', 'pg_catalog')";

fn primary_keys_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("catalog_name", DataType::Utf8, true),
        Field::new("db_schema_name", DataType::Utf8, true),
        Field::new("table_name", DataType::Utf8, false),
        Field::new("column_name", DataType::Utf8, false),
        Field::new("key_name", DataType::Utf8, true),
        Field::new("key_sequence", DataType::Int32, false),
    ]))
}

fn foreign_keys_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("pk_catalog_name", DataType::Utf8, true),
        Field::new("pk_db_schema_name", DataType::Utf8, true),
        Field::new("pk_table_name", DataType::Utf8, false),
        Field::new("pk_column_name", DataType::Utf8, false),
        Field::new("fk_catalog_name", DataType::Utf8, true),
        Field::new("fk_db_schema_name", DataType::Utf8, true),
        Field::new("fk_table_name", DataType::Utf8, false),
        Field::new("fk_column_name", DataType::Utf8, false),
        Field::new("key_sequence", DataType::Int32, false),
        Field::new("fk_key_name", DataType::Utf8, true),
        Field::new("pk_key_name", DataType::Utf8, true),
        Field::new("update_rule", DataType::UInt8, false),
        Field::new("delete_rule", DataType::UInt8, false),
    ]))
}

pub(crate) async fn get_flight_info_catalogs(
    service: &PorterFlightSqlService,
    query: CommandGetCatalogs,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    service.prepare_request(&request)?;
    let schema = query.clone().into_builder().schema();
    flight_info_with_schema(query.as_any().encode_to_vec(), schema, request)
}

pub(crate) async fn do_get_catalogs(
    service: &PorterFlightSqlService,
    query: CommandGetCatalogs,
    request: Request<Ticket>,
) -> Result<Response<<PorterFlightSqlService as FlightService>::DoGetStream>, Status> {
    service.prepare_request(&request)?;
    let state = Arc::clone(service.state());

    let rows = fetch_metadata_rows(
        state,
        "SELECT DISTINCT catalog_name FROM information_schema.schemata",
    )
    .await
    .map_err(PorterFlightSqlService::status_from_error)?;

    let mut builder = query.into_builder();
    for row in rows {
        if let Some(Some(catalog)) = row.first() {
            builder.append(catalog);
        }
    }
    let batch = builder
        .build()
        .map_err(|err| Status::internal(format!("failed to build catalogs batch: {err}")))?;
    stream_single_batch(batch)
}

pub(crate) async fn get_flight_info_schemas(
    service: &PorterFlightSqlService,
    query: CommandGetDbSchemas,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    service.prepare_request(&request)?;
    let schema = query.clone().into_builder().schema();
    flight_info_with_schema(query.as_any().encode_to_vec(), schema, request)
}

pub(crate) async fn do_get_schemas(
    service: &PorterFlightSqlService,
    query: CommandGetDbSchemas,
    request: Request<Ticket>,
) -> Result<Response<<PorterFlightSqlService as FlightService>::DoGetStream>, Status> {
    service.prepare_request(&request)?;
    let state = Arc::clone(service.state());

    let rows = fetch_metadata_rows(state, SCHEMAS_SQL)
        .await
        .map_err(PorterFlightSqlService::status_from_error)?;

    let mut builder = query.into_builder();
    for row in rows {
        let catalog = row.first().cloned().flatten().unwrap_or_default();
        if let Some(Some(schema_name)) = row.get(1) {
            builder.append(catalog, schema_name);
        }
    }
    let batch = builder
        .build()
        .map_err(|err| Status::internal(format!("failed to build schemas batch: {err}")))?;
    stream_single_batch(batch)
}

pub(crate) async fn get_flight_info_tables(
    service: &PorterFlightSqlService,
    query: CommandGetTables,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    service.prepare_request(&request)?;
    let schema = query.clone().into_builder().schema();
    flight_info_with_schema(query.as_any().encode_to_vec(), schema, request)
}

pub(crate) async fn do_get_tables(
    service: &PorterFlightSqlService,
    query: CommandGetTables,
    request: Request<Ticket>,
) -> Result<Response<<PorterFlightSqlService as FlightService>::DoGetStream>, Status> {
    service.prepare_request(&request)?;
    let state = Arc::clone(service.state());
    let include_schema = query.include_schema;

    // Table listings are fingerprint-cached; the schema-bearing variant
    // describes every table and is the expensive one to rebuild.
    let fp = Fingerprint::compute(
        &format!("{TABLES_SQL}|include_schema={include_schema}"),
        &state.backend_identity,
        &[],
    );
    let state_for_build = Arc::clone(&state);
    let query_for_build = query.clone();
    let entry = tokio::task::spawn_blocking(move || {
        state_for_build.cache.get_or_build(&fp, || {
            let batch = build_tables_batch(&state_for_build, query_for_build, include_schema)?;
            Ok(CacheEntry::with_head_batches(batch.schema(), vec![batch]))
        })
    })
    .await
    .map_err(PorterFlightSqlService::status_from_join)?
    .map_err(PorterFlightSqlService::status_from_error)?;
    state.metrics.record_cache_stats(state.cache.stats());

    let batch = entry
        .head_batches
        .first()
        .cloned()
        .ok_or_else(|| Status::internal("cached table listing missing its batch"))?;
    stream_single_batch(batch)
}

fn build_tables_batch(
    state: &Arc<GatewayState>,
    query: CommandGetTables,
    include_schema: bool,
) -> Result<RecordBatch, PorterError> {
    let mut conn = state.acquire_timed()?;
    let rows = fetch_text_rows(&mut *conn, TABLES_SQL)?;

    let mut builder = query.into_builder();
    for row in &rows {
        let catalog = row.first().cloned().flatten().unwrap_or_default();
        let schema_name = row.get(1).cloned().flatten().unwrap_or_else(|| "main".into());
        let name = match row.get(2).cloned().flatten() {
            Some(name) => name,
            None => continue,
        };
        let table_type = normalize_table_type(row.get(3).cloned().flatten());

        let table_schema = if include_schema {
            let qualified = format!("{schema_name}.{name}");
            match conn
                .describe_columns(&format!("SELECT * FROM {qualified}"))
                .and_then(|cols| schema_from_columns(&cols))
            {
                Ok(schema) => schema,
                Err(err) => {
                    warn!(%err, table = %qualified, "failed to load table schema");
                    Schema::empty()
                }
            }
        } else {
            Schema::empty()
        };

        builder
            .append(&catalog, &schema_name, &name, &table_type, &table_schema)
            .map_err(|err| PorterError::Internal(err.to_string()))?;
    }
    builder
        .build()
        .map_err(|err| PorterError::Internal(err.to_string()))
}

pub(crate) async fn get_flight_info_table_types(
    service: &PorterFlightSqlService,
    query: CommandGetTableTypes,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    service.prepare_request(&request)?;
    let schema = query.clone().into_builder().schema();
    flight_info_with_schema(query.as_any().encode_to_vec(), schema, request)
}

pub(crate) async fn do_get_table_types(
    service: &PorterFlightSqlService,
    query: CommandGetTableTypes,
    request: Request<Ticket>,
) -> Result<Response<<PorterFlightSqlService as FlightService>::DoGetStream>, Status> {
    service.prepare_request(&request)?;
    let mut builder = query.into_builder();
    builder.append("TABLE");
    builder.append("VIEW");
    let batch = builder
        .build()
        .map_err(|err| Status::internal(format!("failed to build table types batch: {err}")))?;
    stream_single_batch(batch)
}

pub(crate) async fn get_flight_info_primary_keys(
    service: &PorterFlightSqlService,
    query: CommandGetPrimaryKeys,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    service.prepare_request(&request)?;
    flight_info_with_schema(query.as_any().encode_to_vec(), primary_keys_schema(), request)
}

pub(crate) async fn do_get_primary_keys(
    service: &PorterFlightSqlService,
    _query: CommandGetPrimaryKeys,
    request: Request<Ticket>,
) -> Result<Response<<PorterFlightSqlService as FlightService>::DoGetStream>, Status> {
    service.prepare_request(&request)?;
    stream_single_batch(empty_batch(primary_keys_schema())?)
}

pub(crate) async fn get_flight_info_exported_keys(
    service: &PorterFlightSqlService,
    query: CommandGetExportedKeys,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    service.prepare_request(&request)?;
    flight_info_with_schema(query.as_any().encode_to_vec(), foreign_keys_schema(), request)
}

pub(crate) async fn do_get_exported_keys(
    service: &PorterFlightSqlService,
    _query: CommandGetExportedKeys,
    request: Request<Ticket>,
) -> Result<Response<<PorterFlightSqlService as FlightService>::DoGetStream>, Status> {
    service.prepare_request(&request)?;
    stream_single_batch(empty_batch(foreign_keys_schema())?)
}

pub(crate) async fn get_flight_info_imported_keys(
    service: &PorterFlightSqlService,
    query: CommandGetImportedKeys,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    service.prepare_request(&request)?;
    flight_info_with_schema(query.as_any().encode_to_vec(), foreign_keys_schema(), request)
}

pub(crate) async fn do_get_imported_keys(
    service: &PorterFlightSqlService,
    _query: CommandGetImportedKeys,
    request: Request<Ticket>,
) -> Result<Response<<PorterFlightSqlService as FlightService>::DoGetStream>, Status> {
    service.prepare_request(&request)?;
    stream_single_batch(empty_batch(foreign_keys_schema())?)
}

/// Run a metadata query on a pool handle and collect every row as text.
async fn fetch_metadata_rows(
    state: Arc<GatewayState>,
    sql: &'static str,
) -> Result<Vec<Vec<Option<String>>>, PorterError> {
    tokio::task::spawn_blocking(move || {
        let mut conn = state.acquire_timed()?;
        fetch_text_rows(&mut *conn, sql)
    })
    .await
    .map_err(|err| PorterError::Internal(format!("blocking task failed: {err}")))?
}

fn fetch_text_rows(
    conn: &mut dyn crate::backend::BackendConn,
    sql: &str,
) -> Result<Vec<Vec<Option<String>>>, PorterError> {
    let mut cursor = conn.query(sql, &[])?;
    let mut slots = Vec::with_capacity(cursor.columns().len());
    for col in cursor.columns() {
        let (_, slot) = map_column(col)?;
        slots.push(slot);
    }
    let mut rows = Vec::new();
    while cursor.next_row(&mut slots)? {
        rows.push(slots.iter_mut().map(take_text).collect());
    }
    Ok(rows)
}

fn take_text(slot: &mut ScanSlot) -> Option<String> {
    match slot {
        ScanSlot::Utf8(v) => v.take(),
        ScanSlot::Dynamic(v) => match v.take() {
            Some(CellValue::Text(s)) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

fn normalize_table_type(value: Option<String>) -> String {
    match value.as_deref() {
        Some("BASE TABLE") => "TABLE".to_string(),
        Some("VIEW") => "VIEW".to_string(),
        Some(other) => other.to_string(),
        None => "TABLE".to_string(),
    }
}

fn empty_batch(schema: SchemaRef) -> Result<RecordBatch, Status> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let array: ArrayRef = match field.data_type() {
            DataType::Utf8 => Arc::new(StringArray::from(Vec::<Option<&str>>::new())),
            DataType::Int32 => Arc::new(Int32Array::from(Vec::<Option<i32>>::new())),
            DataType::UInt8 => Arc::new(UInt8Array::from(Vec::<Option<u8>>::new())),
            other => {
                return Err(Status::internal(format!(
                    "unsupported metadata type: {other:?}"
                )))
            }
        };
        columns.push(array);
    }
    RecordBatch::try_new(schema, columns)
        .map_err(|err| Status::internal(format!("failed to build empty batch: {err}")))
}

fn flight_info_with_schema(
    ticket_bytes: Vec<u8>,
    schema: SchemaRef,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    let endpoint = FlightEndpoint::new().with_ticket(Ticket::new(ticket_bytes));
    let descriptor = request.into_inner();
    let info = FlightInfo::new()
        .try_with_schema(schema.as_ref())
        .map_err(|err| Status::internal(format!("failed to encode schema: {err}")))?
        .with_descriptor(descriptor)
        .with_endpoint(endpoint)
        .with_total_records(-1);
    Ok(Response::new(info))
}

pub(crate) fn stream_single_batch(
    batch: RecordBatch,
) -> Result<Response<<PorterFlightSqlService as FlightService>::DoGetStream>, Status> {
    let schema = batch.schema();
    let flight_data =
        arrow_flight::utils::batches_to_flight_data(&schema, vec![batch]).map_err(|err| {
            error!(%err, "failed to convert metadata batch to flight data");
            Status::internal(format!(
                "failed to convert metadata batch to flight data: {err}"
            ))
        })?;
    let stream = PorterFlightSqlService::into_stream(flight_data);
    Ok(Response::new(stream))
}

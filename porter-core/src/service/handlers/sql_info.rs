use arrow_flight::flight_service_server::FlightService;
use arrow_flight::sql::metadata::{SqlInfoData, SqlInfoDataBuilder};
use arrow_flight::sql::{
    CommandGetSqlInfo, ProstMessageExt, SqlInfo, SqlSupportedTransaction,
};
use arrow_flight::{FlightDescriptor, FlightEndpoint, FlightInfo, Ticket};
use prost::Message;
use tonic::{Request, Response, Status};

use crate::service::handlers::metadata::stream_single_batch;
use crate::service::PorterFlightSqlService;

/// Static registration hook for SqlInfo; values are compiled in.
pub(crate) async fn register_sql_info(_id: i32, _result: &SqlInfo) {}

fn server_sql_info() -> Result<SqlInfoData, Status> {
    let mut builder = SqlInfoDataBuilder::new();
    builder.append(SqlInfo::FlightSqlServerName, "porter");
    builder.append(SqlInfo::FlightSqlServerVersion, env!("CARGO_PKG_VERSION"));
    builder.append(SqlInfo::FlightSqlServerArrowVersion, "55");
    builder.append(SqlInfo::FlightSqlServerReadOnly, false);
    builder.append(
        SqlInfo::FlightSqlServerTransaction,
        SqlSupportedTransaction::Transaction as i32,
    );
    builder.append(SqlInfo::SqlTransactionsSupported, true);
    builder.append(SqlInfo::SqlDdlCatalog, false);
    builder.append(SqlInfo::SqlDdlSchema, false);
    builder.append(SqlInfo::SqlDdlTable, true);
    builder
        .build()
        .map_err(|err| Status::internal(format!("failed to build SqlInfo data: {err}")))
}

pub(crate) async fn get_flight_info_sql_info(
    service: &PorterFlightSqlService,
    query: CommandGetSqlInfo,
    request: Request<FlightDescriptor>,
) -> Result<Response<FlightInfo>, Status> {
    service.prepare_request(&request)?;
    let info_data = server_sql_info()?;
    let schema = info_data.schema();

    let ticket_bytes = query.as_any().encode_to_vec();
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

pub(crate) async fn do_get_sql_info(
    service: &PorterFlightSqlService,
    query: CommandGetSqlInfo,
    request: Request<Ticket>,
) -> Result<Response<<PorterFlightSqlService as FlightService>::DoGetStream>, Status> {
    service.prepare_request(&request)?;
    let info_data = server_sql_info()?;
    let batch = query
        .into_builder(&info_data)
        .build()
        .map_err(|err| Status::internal(format!("failed to build SqlInfo response: {err}")))?;
    stream_single_batch(batch)
}

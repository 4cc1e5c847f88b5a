use std::sync::Arc;

use arrow_flight::sql::{
    ActionBeginTransactionRequest, ActionBeginTransactionResult, ActionEndTransactionRequest,
};
use tonic::{Request, Status};
use tracing::info;

use crate::service::state::{decode_handle, encode_handle};
use crate::service::PorterFlightSqlService;

/// Start a transaction pinned to one backend handle.
pub(crate) async fn do_action_begin_transaction(
    service: &PorterFlightSqlService,
    _query: ActionBeginTransactionRequest,
    request: Request<arrow_flight::Action>,
) -> Result<ActionBeginTransactionResult, Status> {
    service.prepare_request(&request)?;
    let state = Arc::clone(service.state());

    let transaction_id = tokio::task::spawn_blocking(move || state.begin_transaction())
        .await
        .map_err(PorterFlightSqlService::status_from_join)?
        .map_err(PorterFlightSqlService::status_from_error)?;

    info!(transaction_id, "transaction started");
    Ok(ActionBeginTransactionResult {
        transaction_id: encode_handle(transaction_id).into(),
    })
}

/// Commit or roll back; either way the pinned handle returns to the
/// pool.
pub(crate) async fn do_action_end_transaction(
    service: &PorterFlightSqlService,
    query: ActionEndTransactionRequest,
    request: Request<arrow_flight::Action>,
) -> Result<(), Status> {
    service.prepare_request(&request)?;
    let transaction_id = decode_handle(&query.transaction_id)
        .map_err(PorterFlightSqlService::status_from_error)?;
    // 1 = commit per the Flight SQL action enum.
    let commit = query.action == 1;
    let state = Arc::clone(service.state());

    tokio::task::spawn_blocking(move || state.end_transaction(transaction_id, commit))
        .await
        .map_err(PorterFlightSqlService::status_from_join)?
        .map_err(PorterFlightSqlService::status_from_error)?;

    let op = if commit { "committed" } else { "rolled back" };
    info!(transaction_id, op, "transaction ended");
    Ok(())
}

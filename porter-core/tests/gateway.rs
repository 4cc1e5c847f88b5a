//! End-to-end dispatcher tests over the embedded in-memory backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow_array::{Array, Int64Array};
use arrow_flight::error::FlightError;
use arrow_flight::sql::server::FlightSqlService;
use arrow_flight::sql::{
    ActionClosePreparedStatementRequest, ActionCreatePreparedStatementRequest, Any,
    CommandStatementQuery, TicketStatementQuery,
};
use arrow_flight::{FlightDescriptor, Ticket};
use futures::{StreamExt, TryStreamExt};
use porter_core::auth::NoAuth;
use porter_core::backend::open;
use porter_core::config::ServerConfig;
use porter_core::pool::{Pool, PoolConfig};
use porter_core::service::{GatewayState, PorterFlightSqlService};
use prost::Message;
use tonic::{Code, Request};

fn test_service(batch_size: usize) -> (PorterFlightSqlService, Arc<GatewayState>) {
    let mut config = ServerConfig::default();
    config.server.batch_size = batch_size;
    config.server.max_connections = 4;
    config.server.acquire_timeout_ms = 2_000;
    let connector = open(&config.database).expect("connector");
    let identity = connector.identity().to_string();
    let kind = connector.kind();
    let pool = Pool::new(connector, PoolConfig::from(&config.server));
    let state = Arc::new(GatewayState::new(&config, pool, kind, identity));
    let service = PorterFlightSqlService::new(Arc::clone(&state), Arc::new(NoAuth));
    (service, state)
}

fn run_sql(state: &Arc<GatewayState>, sql: &str) {
    let mut conn = state.acquire_timed().expect("conn");
    conn.execute(sql, &[]).expect("execute");
}

async fn flight_info(
    service: &PorterFlightSqlService,
    sql: &str,
) -> tonic::Response<arrow_flight::FlightInfo> {
    let query = CommandStatementQuery {
        query: sql.to_string(),
        transaction_id: None,
    };
    service
        .get_flight_info_statement(query, Request::new(FlightDescriptor::default()))
        .await
        .expect("get_flight_info_statement")
}

fn ticket_from_info(info: &arrow_flight::FlightInfo) -> TicketStatementQuery {
    let endpoint = info.endpoint.first().expect("one endpoint");
    let ticket = endpoint.ticket.as_ref().expect("ticket");
    let any = Any::decode(ticket.ticket.as_ref()).expect("any");
    any.unpack::<TicketStatementQuery>()
        .expect("unpack")
        .expect("ticket statement query")
}

async fn do_get_batches(
    service: &PorterFlightSqlService,
    ticket: TicketStatementQuery,
) -> Vec<arrow_array::RecordBatch> {
    let response = service
        .do_get_statement(ticket, Request::new(Ticket::new(Vec::new())))
        .await
        .expect("do_get_statement");
    let stream = response
        .into_inner()
        .map_err(|status| FlightError::Tonic(Box::new(status)));
    arrow_flight::decode::FlightRecordBatchStream::new_from_flight_data(stream)
        .try_collect()
        .await
        .expect("decode batches")
}

/// Streams end on their own schedule; poll until the pool settles.
fn wait_for_pool_settle(state: &Arc<GatewayState>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = state.pool.stats();
        if stats.in_use == 0 && stats.pinned == 0 {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "pool did not settle: {stats:?}"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[tokio::test]
async fn batches_respect_boundaries_and_advertised_schema() {
    let (service, state) = test_service(3);
    run_sql(&state, "CREATE TABLE ids (id BIGINT)");
    run_sql(
        &state,
        "INSERT INTO ids VALUES (1), (2), (3), (4), (5), (6), (7)",
    );

    let info = flight_info(&service, "SELECT id FROM ids ORDER BY id").await;
    let info = info.into_inner();
    let advertised = info.clone().try_decode_schema().expect("schema");

    let batches = do_get_batches(&service, ticket_from_info(&info)).await;
    let sizes: Vec<usize> = batches.iter().map(|b| b.num_rows()).collect();
    assert_eq!(sizes, vec![3, 3, 1]);

    let mut ids = Vec::new();
    for batch in &batches {
        assert_eq!(batch.schema().as_ref(), &advertised);
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        ids.extend(col.iter().flatten());
    }
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);

    wait_for_pool_settle(&state);
    assert!(state.metrics.batches_emitted() >= 3);
}

#[tokio::test]
async fn empty_result_is_clean_eof_with_schema() {
    let (service, state) = test_service(1024);

    let info = flight_info(&service, "SELECT 1 AS f0 WHERE FALSE").await.into_inner();
    let schema = info.clone().try_decode_schema().expect("schema");
    assert_eq!(schema.fields().len(), 1);
    assert_eq!(schema.field(0).name(), "f0");

    let batches = do_get_batches(&service, ticket_from_info(&info)).await;
    assert!(batches.is_empty());
    wait_for_pool_settle(&state);
}

#[tokio::test]
async fn tampered_tickets_are_rejected() {
    let (service, _state) = test_service(1024);
    let ticket = TicketStatementQuery {
        statement_handle: b"garbage".to_vec().into(),
    };
    let status = service
        .do_get_statement(ticket, Request::new(Ticket::new(Vec::new())))
        .await
        .expect_err("garbage ticket must fail");
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn one_shot_tickets_cannot_be_replayed() {
    let (service, state) = test_service(1024);
    let info = flight_info(&service, "SELECT 42 AS answer").await.into_inner();
    let ticket = ticket_from_info(&info);

    let batches = do_get_batches(&service, ticket.clone()).await;
    assert_eq!(batches.len(), 1);

    let status = service
        .do_get_statement(ticket, Request::new(Ticket::new(Vec::new())))
        .await
        .expect_err("consumed statement is gone");
    assert_eq!(status.code(), Code::InvalidArgument);
    wait_for_pool_settle(&state);
}

#[tokio::test]
async fn prepared_statement_lifecycle_releases_its_handle() {
    let (service, state) = test_service(1024);
    run_sql(&state, "CREATE TABLE kv (k BIGINT, v VARCHAR)");
    run_sql(&state, "INSERT INTO kv VALUES (1, 'a'), (2, 'b')");

    let created = service
        .do_action_create_prepared_statement(
            ActionCreatePreparedStatementRequest {
                query: "SELECT k, v FROM kv ORDER BY k".to_string(),
                transaction_id: None,
            },
            Request::new(arrow_flight::Action::default()),
        )
        .await
        .expect("create prepared statement");
    assert!(!created.dataset_schema.is_empty());
    assert_eq!(state.pool.stats().pinned, 1);

    let info = service
        .get_flight_info_prepared_statement(
            arrow_flight::sql::CommandPreparedStatementQuery {
                prepared_statement_handle: created.prepared_statement_handle.clone(),
            },
            Request::new(FlightDescriptor::default()),
        )
        .await
        .expect("flight info")
        .into_inner();

    let batches = do_get_batches(&service, ticket_from_info(&info)).await;
    assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 2);

    // the prepared statement survives its DoGet and can run again
    let info = service
        .get_flight_info_prepared_statement(
            arrow_flight::sql::CommandPreparedStatementQuery {
                prepared_statement_handle: created.prepared_statement_handle.clone(),
            },
            Request::new(FlightDescriptor::default()),
        )
        .await
        .expect("flight info again")
        .into_inner();
    let batches = do_get_batches(&service, ticket_from_info(&info)).await;
    assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 2);

    service
        .do_action_close_prepared_statement(
            ActionClosePreparedStatementRequest {
                prepared_statement_handle: created.prepared_statement_handle,
            },
            Request::new(arrow_flight::Action::default()),
        )
        .await
        .expect("close");
    wait_for_pool_settle(&state);
    assert_eq!(state.statement_count(), 0);
}

#[tokio::test]
async fn transactions_commit_on_their_pinned_handle() {
    let (service, state) = test_service(1024);
    run_sql(&state, "CREATE TABLE t (id BIGINT)");

    let begun = service
        .do_action_begin_transaction(
            arrow_flight::sql::ActionBeginTransactionRequest {},
            Request::new(arrow_flight::Action::default()),
        )
        .await
        .expect("begin");
    assert_eq!(state.pool.stats().pinned, 1);

    // write through the pinned handle
    {
        let txn_id = u64::from_be_bytes(
            begun.transaction_id.as_ref().try_into().expect("8 bytes"),
        );
        let mut conn = state.take_transaction_conn(txn_id).expect("txn conn");
        conn.execute("INSERT INTO t VALUES (10)", &[]).expect("insert");
        state.return_transaction_conn(txn_id, conn);
    }

    service
        .do_action_end_transaction(
            arrow_flight::sql::ActionEndTransactionRequest {
                transaction_id: begun.transaction_id,
                action: 1,
            },
            Request::new(arrow_flight::Action::default()),
        )
        .await
        .expect("commit");
    wait_for_pool_settle(&state);

    let info = flight_info(&service, "SELECT count(*)::BIGINT AS n FROM t").await.into_inner();
    let batches = do_get_batches(&service, ticket_from_info(&info)).await;
    let n = batches[0]
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64")
        .value(0);
    assert_eq!(n, 1);
}

#[tokio::test]
async fn typed_literals_round_trip() {
    use arrow_array::{
        Date32Array, Decimal128Array, Float32Array, StringArray, TimestampMicrosecondArray,
        UInt16Array,
    };
    use arrow_schema::DataType;

    let (service, state) = test_service(1024);
    let sql = "SELECT \
        CAST(1 AS BIGINT) AS i64, \
        CAST(300 AS USMALLINT) AS u16, \
        CAST(1.5 AS FLOAT) AS f32, \
        'hello' AS s, \
        DATE '2024-03-01' AS d, \
        TIMESTAMP '2024-03-01 10:20:30.123456' AS ts, \
        CAST(12.34 AS DECIMAL(10,2)) AS dec";

    let info = flight_info(&service, sql).await.into_inner();
    let batches = do_get_batches(&service, ticket_from_info(&info)).await;
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];

    let i64_col = batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
    assert_eq!(i64_col.value(0), 1);

    let u16_col = batch.column(1).as_any().downcast_ref::<UInt16Array>().unwrap();
    assert_eq!(u16_col.value(0), 300);

    let f32_col = batch.column(2).as_any().downcast_ref::<Float32Array>().unwrap();
    assert_eq!(f32_col.value(0), 1.5);

    let s_col = batch.column(3).as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(s_col.value(0), "hello");

    let d_col = batch.column(4).as_any().downcast_ref::<Date32Array>().unwrap();
    // days since the Unix epoch for 2024-03-01
    assert_eq!(d_col.value(0), 19783);

    let ts_col = batch
        .column(5)
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .unwrap();
    assert_eq!(ts_col.value(0), 1_709_288_430_123_456);

    assert_eq!(batch.schema().field(6).data_type(), &DataType::Decimal128(10, 2));
    let dec_col = batch
        .column(6)
        .as_any()
        .downcast_ref::<Decimal128Array>()
        .unwrap();
    assert_eq!(dec_col.value(0), 1234);

    wait_for_pool_settle(&state);
}

#[tokio::test]
async fn cancellation_mid_stream_returns_the_handle() {
    let (service, state) = test_service(128);

    let info = flight_info(&service, "SELECT * FROM range(1000000)").await.into_inner();
    let response = service
        .do_get_statement(ticket_from_info(&info), Request::new(Ticket::new(Vec::new())))
        .await
        .expect("do_get");
    let mut stream = response.into_inner();

    // take a little of the stream, then hang up
    let first = stream.next().await.expect("schema frame").expect("ok");
    assert!(!first.data_header.is_empty() || !first.data_body.is_empty());
    drop(stream);

    wait_for_pool_settle(&state);
}

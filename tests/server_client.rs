use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

use query_harness::config::QueryServerConfig;
use query_harness::server::codec::JsonRpcCodec;
use query_harness::server::{
    CancellationContext, CompilationTarget, CompileQueryParams, Dataset, ExtraOptions,
    ProgressMessage, ProgressSink, QlProgram, QueryResultType, QueryServer, QueryServerClient,
    RunQuery, ServerError,
};

const STEP: Duration = Duration::from_secs(5);

struct FakeServer {
    rx: FramedRead<ReadHalf<DuplexStream>, JsonRpcCodec>,
    tx: FramedWrite<WriteHalf<DuplexStream>, JsonRpcCodec>,
}

impl FakeServer {
    async fn recv(&mut self) -> Value {
        timeout(STEP, self.rx.next())
            .await
            .expect("client sent nothing")
            .expect("client closed the transport")
            .expect("bad frame from client")
    }

    async fn send(&mut self, message: Value) {
        self.tx.send(message).await.unwrap();
    }

    async fn respond(&mut self, request: &Value, result: Value) {
        self.send(json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }))
            .await;
    }
}

fn transport() -> (
    (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>),
    FakeServer,
) {
    let (client_io, server_io) = duplex(256 * 1024);
    let (server_read, server_write) = split(server_io);
    (
        split(client_io),
        FakeServer {
            rx: FramedRead::new(server_read, JsonRpcCodec::default()),
            tx: FramedWrite::new(server_write, JsonRpcCodec::default()),
        },
    )
}

fn connect(config: QueryServerConfig) -> (Arc<QueryServerClient>, FakeServer) {
    let ((read, write), server) = transport();
    (Arc::new(QueryServerClient::connect(read, write, config)), server)
}

fn compile_params(query: &str) -> CompileQueryParams {
    CompileQueryParams {
        compilation_options: Default::default(),
        extra_options: ExtraOptions { timeout_secs: 600 },
        query_to_check: QlProgram {
            library_path: vec![],
            dbscheme_path: "/db/semmlecode.dbscheme".into(),
            query_path: query.into(),
        },
        result_path: "/out/compiledQuery.qlo".into(),
        target: CompilationTarget::Query {},
    }
}

#[tokio::test]
async fn responses_are_routed_by_id_not_arrival_order() {
    let (client, mut server) = connect(QueryServerConfig::default());

    let first = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .compile_query(compile_params("first.ql"), &CancellationContext::new(), None)
                .await
        })
    };
    let req_a = server.recv().await;
    let second = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .compile_query(compile_params("second.ql"), &CancellationContext::new(), None)
                .await
        })
    };
    let req_b = server.recv().await;
    assert_eq!(req_a["method"], "compilation/compileQuery");
    assert_ne!(req_a["id"], req_b["id"]);

    // Answer in reverse order; each answer names the query it belongs to.
    for req in [&req_b, &req_a] {
        let query = req["params"]["body"]["queryToCheck"]["queryPath"].clone();
        server
            .respond(
                req,
                json!({ "fromCache": query == "first.ql", "messages": [], "resultPatterns": [] }),
            )
            .await;
    }

    let first = timeout(STEP, first).await.unwrap().unwrap().unwrap();
    let second = timeout(STEP, second).await.unwrap().unwrap().unwrap();
    assert!(first.from_cache);
    assert!(!second.from_cache);
}

#[tokio::test]
async fn query_completed_callback_reaches_the_waiting_run() {
    let (client, mut server) = connect(QueryServerConfig::default());

    let run = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .run_query(
                    RunQuery {
                        db: Dataset::new("/db/db-java"),
                        compiled_query: "/out/compiledQuery.qlo".into(),
                        compiled_upgrade: None,
                        results_path: "/out/results.bqrs".into(),
                        log_path: Some("/out/query.log".into()),
                    },
                    &CancellationContext::new(),
                    None,
                )
                .await
        })
    };

    let request = server.recv().await;
    assert_eq!(request["method"], "evaluation/runQueries");
    let body = &request["params"]["body"];
    let evaluate_id = body["evaluateId"].clone();
    assert_eq!(body["queries"][0]["timeoutSecs"], 600);

    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": 9001,
            "method": "evaluation/queryCompleted",
            "params": {
                "runId": evaluate_id,
                "queryId": 0,
                "resultType": 0,
                "evaluationTime": 2500,
            },
        }))
        .await;
    let ack = server.recv().await;
    assert_eq!(ack["id"], 9001);
    assert_eq!(ack["result"], json!({}));

    server.respond(&request, json!({})).await;

    let result = timeout(STEP, run).await.unwrap().unwrap().unwrap();
    assert_eq!(result.result_type, QueryResultType::Success);
    assert_eq!(result.evaluation_time, 2500);
    assert_eq!(result.log_file_location.as_deref(), Some("/out/query.log"));
}

#[tokio::test]
async fn run_without_completion_reports_no_result() {
    let (client, mut server) = connect(QueryServerConfig::default());
    let run = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .run_query(
                    RunQuery {
                        db: Dataset::new("/db/db-java"),
                        compiled_query: "/out/compiledQuery.qlo".into(),
                        compiled_upgrade: None,
                        results_path: "/out/results.bqrs".into(),
                        log_path: None,
                    },
                    &CancellationContext::new(),
                    None,
                )
                .await
        })
    };
    let request = server.recv().await;
    server.respond(&request, json!({})).await;

    let result = timeout(STEP, run).await.unwrap().unwrap().unwrap();
    assert_eq!(result.result_type, QueryResultType::OtherError);
    assert_eq!(result.message.as_deref(), Some("No result from server"));
}

#[tokio::test]
async fn progress_notifications_reach_the_request_sink() {
    let (client, mut server) = connect(QueryServerConfig::default());
    let seen: Arc<Mutex<Vec<ProgressMessage>>> = Arc::default();
    let sink: Arc<dyn ProgressSink> = {
        let seen = seen.clone();
        Arc::new(move |p: &ProgressMessage| seen.lock().unwrap().push(p.clone()))
    };

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .compile_query(compile_params("q.ql"), &CancellationContext::new(), Some(sink))
                .await
        })
    };
    let request = server.recv().await;
    let progress_id = request["params"]["progressId"].clone();
    server
        .send(json!({
            "jsonrpc": "2.0",
            "method": "semmle/progressUpdated",
            "params": { "id": progress_id, "step": 1, "maxStep": 3, "message": "Compiling" },
        }))
        .await;
    server.respond(&request, json!({})).await;

    timeout(STEP, call).await.unwrap().unwrap().unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].message, "Compiling");
    assert_eq!(seen[0].max_step, 3);
}

#[tokio::test]
async fn cancellation_resolves_even_if_server_never_answers() {
    let config = QueryServerConfig {
        cancel_grace: Duration::from_millis(100),
        ..Default::default()
    };
    let (client, mut server) = connect(config);
    let cancel = CancellationContext::new();

    let call = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.compile_query(compile_params("slow.ql"), &cancel, None).await })
    };
    let request = server.recv().await;
    cancel.cancel();

    let cancel_request = server.recv().await;
    assert_eq!(cancel_request["method"], "$/cancelRequest");
    assert_eq!(cancel_request["params"]["id"], request["id"]);

    let err = timeout(STEP, call).await.unwrap().unwrap().unwrap_err();
    assert!(err.is_cancellation(), "unexpected error: {err}");
}

#[tokio::test]
async fn server_cancellation_error_code_maps_to_cancelled() {
    let (client, mut server) = connect(QueryServerConfig::default());
    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .compile_query(compile_params("q.ql"), &CancellationContext::new(), None)
                .await
        })
    };
    let request = server.recv().await;
    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": { "code": -32800, "message": "Request cancelled" },
        }))
        .await;

    let err = timeout(STEP, call).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, ServerError::Cancelled));
}

#[tokio::test]
async fn other_server_errors_keep_their_code() {
    let (client, mut server) = connect(QueryServerConfig::default());
    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .compile_query(compile_params("q.ql"), &CancellationContext::new(), None)
                .await
        })
    };
    let request = server.recv().await;
    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": { "code": -32603, "message": "internal" },
        }))
        .await;

    let err = timeout(STEP, call).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.code(), Some(-32603));
}

#[tokio::test]
async fn transport_loss_fails_everything_in_flight() {
    let (client, mut server) = connect(QueryServerConfig::default());
    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .compile_query(compile_params("q.ql"), &CancellationContext::new(), None)
                .await
        })
    };
    server.recv().await;
    drop(server);

    let err = timeout(STEP, call).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, ServerError::ServerRestarted { .. }), "unexpected error: {err}");
    assert!(err.is_transient());
}

#[tokio::test]
async fn clear_cache_sends_the_dataset() {
    let (client, mut server) = connect(QueryServerConfig::default());
    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .clear_cache(Dataset::new("/db/db-java"), true, &CancellationContext::new())
                .await
        })
    };
    let request = server.recv().await;
    assert_eq!(request["method"], "evaluation/clearCache");
    assert_eq!(request["params"]["body"]["dryRun"], true);
    assert_eq!(request["params"]["body"]["db"]["dbDir"], "/db/db-java");
    server
        .respond(&request, json!({ "deletionMessage": "Would delete 3 files" }))
        .await;

    let result = timeout(STEP, call).await.unwrap().unwrap().unwrap();
    assert_eq!(result.deletion_message, "Would delete 3 files");
}

#[tokio::test]
async fn requests_after_shutdown_report_not_running() {
    let (client, _server) = connect(QueryServerConfig::default());
    client.shutdown().await;

    let err = client
        .compile_query(compile_params("q.ql"), &CancellationContext::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::NotRunning));
    assert!(!err.is_cancellation());
}

#[tokio::test]
async fn replacing_the_transport_fails_old_requests_and_serves_new_ones() {
    let (client, mut old_server) = connect(QueryServerConfig::default());
    let stale = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .compile_query(compile_params("old.ql"), &CancellationContext::new(), None)
                .await
        })
    };
    old_server.recv().await;

    let ((read, write), mut new_server) = transport();
    client.replace_transport(read, write);

    let err = timeout(STEP, stale).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, ServerError::ServerRestarted { .. }));

    let fresh = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .compile_query(compile_params("new.ql"), &CancellationContext::new(), None)
                .await
        })
    };
    let request = new_server.recv().await;
    server_reply_empty(&mut new_server, &request).await;
    assert!(timeout(STEP, fresh).await.unwrap().unwrap().is_ok());
}

async fn server_reply_empty(server: &mut FakeServer, request: &Value) {
    server
        .respond(request, json!({ "messages": [], "resultPatterns": [] }))
        .await;
}

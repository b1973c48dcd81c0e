use futures::{SinkExt, StreamExt};
use serde_json::{json, Value as Json};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use hrana_client::{ws, Batch, BatchCond, Error, IntMode, ProtocolError, Value, Version};

type Ws = WebSocketStream<TcpStream>;

async fn serve_once<F, Fut>(
    subprotocol: Option<&'static str>,
    handler: F,
) -> (String, JoinHandle<()>)
where
    F: FnOnce(Ws) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |_req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            if let Some(proto) = subprotocol {
                resp.headers_mut()
                    .insert("Sec-WebSocket-Protocol", proto.parse().unwrap());
            }
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        handler(ws).await;
    });
    (format!("ws://{addr}"), task)
}

async fn join(task: JoinHandle<()>) {
    timeout(Duration::from_secs(5), task)
        .await
        .expect("server task timed out")
        .expect("server task panicked");
}

async fn recv_json(ws: &mut Ws) -> Option<Json> {
    while let Some(msg) = ws.next().await {
        match msg.ok()? {
            Message::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
            Message::Ping(data) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Message::Close(_) => return None,
            _ => panic!("unexpected websocket message"),
        }
    }
    None
}

async fn send_json(ws: &mut Ws, value: Json) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn expect_hello(ws: &mut Ws) {
    let msg = recv_json(ws).await.expect("expected a hello message");
    assert_eq!(msg["type"], "hello");
    send_json(ws, json!({"type": "hello_ok"})).await;
}

/// Reads a request, asserts its type, and returns (request_id, request).
async fn expect_request(ws: &mut Ws, expected_type: &str) -> (Json, Json) {
    let msg = recv_json(ws).await.expect("expected a request message");
    assert_eq!(msg["type"], "request", "unexpected message: {msg}");
    let request = msg["request"].clone();
    assert_eq!(request["type"], expected_type, "unexpected request: {request}");
    (msg["request_id"].clone(), request)
}

async fn respond_ok(ws: &mut Ws, request_id: Json, response: Json) {
    send_json(
        ws,
        json!({"type": "response_ok", "request_id": request_id, "response": response}),
    )
    .await;
}

async fn drain(mut ws: Ws) {
    while recv_json(&mut ws).await.is_some() {}
}

fn stmt_result(cols: Json, rows: Json) -> Json {
    json!({
        "cols": cols,
        "rows": rows,
        "affected_row_count": 0,
        "last_insert_rowid": null,
    })
}

#[tokio::test]
async fn negotiates_subprotocol() {
    let (url, task) = serve_once(Some("hrana3"), |mut ws| async move {
        expect_hello(&mut ws).await;
        drain(ws).await;
    })
    .await;

    let client = ws::connect(&url, None).await.unwrap();
    assert_eq!(client.get_version().await.unwrap(), Version::Hrana3);
    client.close().await;
    join(task).await;
}

#[tokio::test]
async fn no_subprotocol_means_hrana1() {
    let (url, task) = serve_once(None, |mut ws| async move {
        expect_hello(&mut ws).await;
        drain(ws).await;
    })
    .await;

    let client = ws::connect(&url, None).await.unwrap();
    assert_eq!(client.get_version().await.unwrap(), Version::Hrana1);

    // v2 and v3 features fail synchronously on a v1 connection.
    assert!(matches!(
        client.store_sql("SELECT 1").await,
        Err(Error::VersionNotSupported { feature: "store_sql", .. })
    ));
    let stream = client.open_stream().unwrap();
    assert!(matches!(
        stream.get_autocommit().await,
        Err(Error::VersionNotSupported { feature: "get_autocommit", .. })
    ));
    assert!(matches!(
        stream.cursor(Batch::new()).await,
        Err(Error::VersionNotSupported { feature: "cursor", .. })
    ));

    client.close().await;
    join(task).await;
}

#[tokio::test]
async fn hello_carries_jwt() {
    let (url, task) = serve_once(Some("hrana2"), |mut ws| async move {
        let msg = recv_json(&mut ws).await.unwrap();
        assert_eq!(msg["type"], "hello");
        assert_eq!(msg["jwt"], "token-123");
        send_json(&mut ws, json!({"type": "hello_ok"})).await;
        drain(ws).await;
    })
    .await;

    let client = ws::connect(&url, Some("token-123".into())).await.unwrap();
    client.close().await;
    join(task).await;
}

#[tokio::test]
async fn query_returns_row_shape() {
    let (url, task) = serve_once(Some("hrana3"), |mut ws| async move {
        expect_hello(&mut ws).await;
        let (id, request) = expect_request(&mut ws, "open_stream").await;
        assert_eq!(request["stream_id"], 1);
        respond_ok(&mut ws, id, json!({"type": "open_stream"})).await;

        let (id, request) = expect_request(&mut ws, "execute").await;
        assert_eq!(request["stmt"]["want_rows"], true);
        respond_ok(
            &mut ws,
            id,
            json!({"type": "execute", "result": stmt_result(
                json!([{"name": "one"}, {"name": "two"}, {"name": "three"}, {"name": "four"}]),
                json!([[
                    {"type": "integer", "value": "1"},
                    {"type": "text", "value": "elephant"},
                    {"type": "float", "value": 42.5},
                    {"type": "null"},
                ]]),
            )}),
        )
        .await;
        drain(ws).await;
    })
    .await;

    let client = ws::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();
    let result = stream
        .query("SELECT 1 AS one, 'elephant' AS two, 42.5 AS three, NULL AS four")
        .await
        .unwrap();

    assert_eq!(
        result.column_names(),
        vec![Some("one"), Some("two"), Some("three"), Some("four")]
    );
    let row = &result.rows()[0];
    assert_eq!(row[0], Value::Integer(1));
    assert_eq!(row[1], Value::Text("elephant".into()));
    assert_eq!(row[2], Value::Real(42.5));
    assert_eq!(row[3], Value::Null);
    assert_eq!(row.get_by_name("one"), Some(&row[0]));

    client.close().await;
    join(task).await;
}

#[tokio::test]
async fn pipelined_requests_keep_submission_order() {
    const N: usize = 10;

    let (url, task) = serve_once(Some("hrana3"), |mut ws| async move {
        expect_hello(&mut ws).await;
        let (id, _) = expect_request(&mut ws, "open_stream").await;
        respond_ok(&mut ws, id, json!({"type": "open_stream"})).await;

        for i in 0..N {
            let (id, request) = expect_request(&mut ws, "execute").await;
            // Requests must arrive in submission order.
            assert_eq!(request["stmt"]["sql"], format!("SELECT {i}"));
            respond_ok(
                &mut ws,
                id,
                json!({"type": "execute", "result": stmt_result(
                    json!([{"name": "i"}]),
                    json!([[{"type": "integer", "value": i.to_string()}]]),
                )}),
            )
            .await;
        }
        drain(ws).await;
    })
    .await;

    let client = ws::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();

    // Submit everything up front, without awaiting in between.
    let queries: Vec<_> = (0..N)
        .map(|i| stream.query_value(format!("SELECT {i}")))
        .collect();
    let results = futures::future::join_all(queries).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), Some(Value::Integer(i as i64)));
    }

    client.close().await;
    join(task).await;
}

#[tokio::test]
async fn response_error_does_not_close_the_stream() {
    let (url, task) = serve_once(Some("hrana3"), |mut ws| async move {
        expect_hello(&mut ws).await;
        let (id, _) = expect_request(&mut ws, "open_stream").await;
        respond_ok(&mut ws, id, json!({"type": "open_stream"})).await;

        let (id, _) = expect_request(&mut ws, "execute").await;
        send_json(
            &mut ws,
            json!({"type": "response_error", "request_id": id,
                   "error": {"message": "no such column: foobar", "code": "SQLITE_ERROR"}}),
        )
        .await;

        let (id, _) = expect_request(&mut ws, "execute").await;
        respond_ok(
            &mut ws,
            id,
            json!({"type": "execute", "result": stmt_result(
                json!([{"name": "x"}]),
                json!([[{"type": "integer", "value": "1"}]]),
            )}),
        )
        .await;
        drain(ws).await;
    })
    .await;

    let client = ws::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();

    let err = stream.query("SELECT foobar").await.unwrap_err();
    match err {
        Error::Response(err) => {
            assert_eq!(err.message, "no such column: foobar");
            assert_eq!(err.code.as_deref(), Some("SQLITE_ERROR"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The stream is still usable after a response error.
    let value = stream.query_value("SELECT 1").await.unwrap();
    assert_eq!(value, Some(Value::Integer(1)));

    client.close().await;
    join(task).await;
}

#[tokio::test]
async fn large_integers_follow_int_mode() {
    let big = i64::MAX;
    let (url, task) = serve_once(Some("hrana3"), move |mut ws| async move {
        expect_hello(&mut ws).await;
        let (id, _) = expect_request(&mut ws, "open_stream").await;
        respond_ok(&mut ws, id, json!({"type": "open_stream"})).await;

        for _ in 0..2 {
            let (id, _) = expect_request(&mut ws, "execute").await;
            respond_ok(
                &mut ws,
                id,
                json!({"type": "execute", "result": {
                    "cols": [{"name": "id"}],
                    "rows": [[{"type": "integer", "value": big.to_string()}]],
                    "affected_row_count": 1,
                    "last_insert_rowid": big.to_string(),
                }}),
            )
            .await;
        }
        drain(ws).await;
    })
    .await;

    let client = ws::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();

    let result = stream.run("INSERT INTO t(id) VALUES (9223372036854775807)").await.unwrap();
    assert_eq!(result.last_insert_rowid, Some(big));

    stream.set_int_mode(IntMode::Real);
    assert!(matches!(
        stream.query_value("SELECT id FROM t").await,
        Err(Error::Range(_))
    ));

    client.close().await;
    join(task).await;
}

#[tokio::test]
async fn batch_conditions_skip_steps() {
    let (url, task) = serve_once(Some("hrana3"), |mut ws| async move {
        expect_hello(&mut ws).await;
        let (id, _) = expect_request(&mut ws, "open_stream").await;
        respond_ok(&mut ws, id, json!({"type": "open_stream"})).await;

        let (id, request) = expect_request(&mut ws, "batch").await;
        let steps = request["batch"]["steps"].as_array().unwrap().clone();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0]["condition"], Json::Null);
        assert_eq!(steps[2]["condition"], json!({"type": "ok", "step": 0}));
        assert_eq!(steps[3]["condition"], json!({"type": "ok", "step": 1}));

        let one = stmt_result(json!([{"name": "x"}]), json!([[{"type": "integer", "value": "1"}]]));
        respond_ok(
            &mut ws,
            id,
            json!({"type": "batch", "result": {
                "step_results": [one.clone(), null, one, null],
                "step_errors": [null, {"message": "no such column: foobar"}, null, null],
            }}),
        )
        .await;
        drain(ws).await;
    })
    .await;

    let client = ws::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();

    let mut batch = Batch::new();
    let a = batch.step("SELECT 1");
    let b = batch.step("SELECT foobar");
    let c = batch
        .step_with_cond(BatchCond::Ok { step: a }, "SELECT 1")
        .unwrap();
    let d = batch
        .step_with_cond(BatchCond::Ok { step: b }, "SELECT 1")
        .unwrap();

    let results = stream.batch(batch).await.unwrap();
    assert!(results.step_result(a).is_some());
    assert_eq!(
        results.step_error(b).unwrap().message,
        "no such column: foobar"
    );
    let c_result = results.step_result(c).unwrap();
    assert_eq!(c_result.rows()[0][0], Value::Integer(1));
    assert!(results.step_skipped(d));

    client.close().await;
    join(task).await;
}

#[tokio::test]
async fn cursor_streams_entries_in_order() {
    let (url, task) = serve_once(Some("hrana3"), |mut ws| async move {
        expect_hello(&mut ws).await;
        let (id, _) = expect_request(&mut ws, "open_stream").await;
        respond_ok(&mut ws, id, json!({"type": "open_stream"})).await;

        let (id, request) = expect_request(&mut ws, "open_cursor").await;
        assert_eq!(request["cursor_id"], 1);
        respond_ok(&mut ws, id, json!({"type": "open_cursor"})).await;

        let (id, request) = expect_request(&mut ws, "fetch_cursor").await;
        assert_eq!(request["cursor_id"], 1);
        respond_ok(
            &mut ws,
            id,
            json!({"type": "fetch_cursor", "done": true, "entries": [
                {"type": "step_begin", "step": 0, "cols": [{"name": "x"}]},
                {"type": "row", "row": [{"type": "integer", "value": "1"}]},
                {"type": "row", "row": [{"type": "integer", "value": "2"}]},
                {"type": "step_end", "affected_row_count": 0, "last_insert_rowid": null},
                {"type": "step_begin", "step": 1, "cols": [{"name": "y"}]},
                {"type": "row", "row": [{"type": "integer", "value": "3"}]},
                {"type": "step_end", "affected_row_count": 0, "last_insert_rowid": null},
            ]}),
        )
        .await;

        let (_id, request) = expect_request(&mut ws, "close_cursor").await;
        assert_eq!(request["cursor_id"], 1);
        drain(ws).await;
    })
    .await;

    let client = ws::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();

    let mut batch = Batch::new();
    batch.step("SELECT 1 AS x UNION ALL SELECT 2");
    batch.step("SELECT 3 AS y");
    let mut cursor = stream.cursor(batch).await.unwrap();

    use hrana_client::CursorEntry;
    match cursor.next().await.unwrap().unwrap() {
        CursorEntry::StepBegin { step: 0, .. } => {}
        other => panic!("unexpected entry: {other:?}"),
    }
    for expected in [1, 2] {
        match cursor.next().await.unwrap().unwrap() {
            CursorEntry::Row(row) => {
                assert_eq!(row[0], Value::Integer(expected));
                assert_eq!(row.get_by_name("x"), Some(&Value::Integer(expected)));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }
    assert!(matches!(
        cursor.next().await.unwrap().unwrap(),
        CursorEntry::StepEnd { .. }
    ));
    assert!(matches!(
        cursor.next().await.unwrap().unwrap(),
        CursorEntry::StepBegin { step: 1, .. }
    ));
    assert!(matches!(
        cursor.next().await.unwrap().unwrap(),
        CursorEntry::Row(_)
    ));
    assert!(matches!(
        cursor.next().await.unwrap().unwrap(),
        CursorEntry::StepEnd { .. }
    ));
    assert!(cursor.next().await.unwrap().is_none());

    cursor.close().await;
    client.close().await;
    join(task).await;
}

#[tokio::test]
async fn server_disconnect_fails_pending_operations() {
    let (url, task) = serve_once(Some("hrana3"), |mut ws| async move {
        expect_hello(&mut ws).await;
        let (id, _) = expect_request(&mut ws, "open_stream").await;
        respond_ok(&mut ws, id, json!({"type": "open_stream"})).await;
        // Read the execute request, then vanish without responding.
        let _ = expect_request(&mut ws, "execute").await;
    })
    .await;

    let client = ws::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();

    let err = stream.query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)), "unexpected error: {err}");

    // Everything after the transport loss fails with a closed error too.
    let err = stream.query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)), "unexpected error: {err}");

    join(task).await;
}

#[tokio::test]
async fn duplicate_hello_is_fatal() {
    let (url, task) = serve_once(Some("hrana3"), |mut ws| async move {
        let msg = recv_json(&mut ws).await.unwrap();
        assert_eq!(msg["type"], "hello");
        send_json(&mut ws, json!({"type": "hello_ok"})).await;
        send_json(&mut ws, json!({"type": "hello_ok"})).await;
        drain(ws).await;
    })
    .await;

    let client = ws::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();
    let err = stream.query("SELECT 1").await.unwrap_err();
    match err {
        Error::Closed(cause) => assert!(
            matches!(&*cause, Error::Protocol(ProtocolError::DuplicateHello)),
            "unexpected cause: {cause}"
        ),
        other => panic!("unexpected error: {other}"),
    }

    join(task).await;
}

#[tokio::test]
async fn stream_close_rejects_queued_work() {
    let (url, task) = serve_once(Some("hrana3"), |mut ws| async move {
        expect_hello(&mut ws).await;
        let (id, _) = expect_request(&mut ws, "open_stream").await;
        respond_ok(&mut ws, id, json!({"type": "open_stream"})).await;
        drain(ws).await;
    })
    .await;

    let client = ws::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();
    stream.close();

    let err = stream.query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)), "unexpected error: {err}");

    client.close().await;
    join(task).await;
}

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use tokio::task::JoinHandle;

use hrana_client::{http, Batch, Error, Statement, Value, Version};

type Handler = Arc<dyn Fn(Request<Body>) -> BoxFuture<'static, Response<Body>> + Send + Sync>;

fn spawn_server(handler: Handler) -> (String, JoinHandle<()>) {
    let make = make_service_fn(move |_conn| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler(req).await) }
            }))
        }
    });
    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make);
    let addr = server.local_addr();
    let task = tokio::spawn(async move {
        let _ = server.await;
    });
    (format!("http://{addr}"), task)
}

fn json_response(status: u16, body: Json) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(404)
        .body(Body::from("not found"))
        .unwrap()
}

fn execute_ok(value: Json) -> Json {
    json!({"type": "ok", "response": {"type": "execute", "result": {
        "cols": [{"name": "x", "decltype": null}],
        "rows": [[value]],
        "affected_row_count": 0,
        "last_insert_rowid": null,
    }}})
}

async fn read_json(body: Body) -> Json {
    let bytes = hyper::body::to_bytes(body).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn falls_back_to_v2_and_executes() {
    let handler: Handler = Arc::new(move |req| {
        Box::pin(async move {
            assert_eq!(
                req.headers().get("authorization").and_then(|h| h.to_str().ok()),
                Some("Bearer secret-token")
            );
            match (req.method().clone(), req.uri().path().to_string()) {
                (Method::GET, path) if path == "/v3-protobuf" || path == "/v3" => not_found(),
                (Method::POST, path) if path == "/v2/pipeline" => {
                    let msg = read_json(req.into_body()).await;
                    assert_eq!(msg["baton"], Json::Null);
                    let requests = msg["requests"].as_array().unwrap();
                    assert_eq!(requests.len(), 1);
                    assert_eq!(requests[0]["type"], "execute");
                    json_response(
                        200,
                        json!({
                            "baton": null,
                            "base_url": null,
                            "results": [execute_ok(json!({"type": "integer", "value": "7"}))],
                        }),
                    )
                }
                other => panic!("unexpected request: {other:?}"),
            }
        })
    });
    let (url, task) = spawn_server(handler);

    let client = http::connect(&url, Some("secret-token")).await.unwrap();
    assert_eq!(client.get_version().await.unwrap(), Version::Hrana2);

    let stream = client.open_stream().unwrap();
    let value = stream.query_value("SELECT 7").await.unwrap();
    assert_eq!(value, Some(Value::Integer(7)));

    // v3 features are rejected on a v2 connection.
    assert!(matches!(
        stream.get_autocommit().await,
        Err(Error::VersionNotSupported { feature: "get_autocommit", .. })
    ));

    task.abort();
}

#[tokio::test]
async fn chains_batons_between_pipeline_requests() {
    let batons: Arc<Mutex<Vec<Json>>> = Arc::new(Mutex::new(Vec::new()));
    let handler: Handler = {
        let batons = batons.clone();
        Arc::new(move |req| {
            let batons = batons.clone();
            Box::pin(async move {
                match (req.method().clone(), req.uri().path().to_string()) {
                    (Method::GET, path) if path == "/v3-protobuf" => not_found(),
                    (Method::GET, path) if path == "/v3" => json_response(200, json!({"version": 3})),
                    (Method::POST, path) if path == "/v3/pipeline" => {
                        let msg = read_json(req.into_body()).await;
                        let n = {
                            let mut batons = batons.lock();
                            batons.push(msg["baton"].clone());
                            batons.len()
                        };
                        json_response(
                            200,
                            json!({
                                "baton": format!("baton-{n}"),
                                "base_url": null,
                                "results": [execute_ok(json!({"type": "integer", "value": n.to_string()}))],
                            }),
                        )
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            })
        })
    };
    let (url, task) = spawn_server(handler);

    let client = http::connect(&url, None).await.unwrap();
    assert_eq!(client.version(), Version::Hrana3);
    let stream = client.open_stream().unwrap();

    for expected in 1..=3i64 {
        let value = stream.query_value(format!("SELECT {expected}")).await.unwrap();
        assert_eq!(value, Some(Value::Integer(expected)));
    }

    let batons = batons.lock().clone();
    assert_eq!(batons, vec![Json::Null, json!("baton-1"), json!("baton-2")]);

    task.abort();
}

#[tokio::test]
async fn stored_sql_is_shipped_lazily() {
    let request_log: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let handler: Handler = {
        let request_log = request_log.clone();
        Arc::new(move |req| {
            let request_log = request_log.clone();
            Box::pin(async move {
                match (req.method().clone(), req.uri().path().to_string()) {
                    (Method::GET, path) if path == "/v3-protobuf" => not_found(),
                    (Method::GET, path) if path == "/v3" => json_response(200, json!({})),
                    (Method::POST, path) if path == "/v3/pipeline" => {
                        let msg = read_json(req.into_body()).await;
                        let requests = msg["requests"].as_array().unwrap().clone();
                        request_log.lock().push(
                            requests
                                .iter()
                                .map(|r| r["type"].as_str().unwrap().to_string())
                                .collect(),
                        );
                        let results: Vec<Json> = requests
                            .iter()
                            .map(|request| match request["type"].as_str().unwrap() {
                                "store_sql" => {
                                    assert_eq!(request["sql_id"], 1);
                                    assert_eq!(request["sql"], "SELECT 7");
                                    json!({"type": "ok", "response": {"type": "store_sql"}})
                                }
                                "execute" => {
                                    assert_eq!(request["stmt"]["sql_id"], 1);
                                    assert_eq!(request["stmt"]["sql"], Json::Null);
                                    execute_ok(json!({"type": "integer", "value": "7"}))
                                }
                                other => panic!("unexpected request type: {other}"),
                            })
                            .collect();
                        json_response(
                            200,
                            json!({"baton": "b", "base_url": null, "results": results}),
                        )
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            })
        })
    };
    let (url, task) = spawn_server(handler);

    let client = http::connect(&url, None).await.unwrap();
    let sql = client.store_sql("SELECT 7").await.unwrap();
    let stream = client.open_stream().unwrap();

    // First use ships store_sql + execute in one pipeline request.
    let value = stream
        .query_value(Statement::from_stored(&sql))
        .await
        .unwrap();
    assert_eq!(value, Some(Value::Integer(7)));

    // Second use refers to the stored id only.
    let value = stream
        .query_value(Statement::from_stored(&sql))
        .await
        .unwrap();
    assert_eq!(value, Some(Value::Integer(7)));

    let log = request_log.lock().clone();
    assert_eq!(
        log,
        vec![
            vec!["store_sql".to_string(), "execute".to_string()],
            vec!["execute".to_string()],
        ]
    );

    // A closed handle is a misuse error, detected client-side.
    client.close_sql(sql.clone()).await.unwrap();
    let err = stream
        .query_value(Statement::from_stored(&sql))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Misuse(_)), "unexpected error: {err}");

    task.abort();
}

#[tokio::test]
async fn cursor_parses_newline_framed_body() {
    let handler: Handler = Arc::new(move |req| {
        Box::pin(async move {
            match (req.method().clone(), req.uri().path().to_string()) {
                (Method::GET, path) if path == "/v3-protobuf" => not_found(),
                (Method::GET, path) if path == "/v3" => json_response(200, json!({})),
                (Method::POST, path) if path == "/v3/cursor" => {
                    let msg = read_json(req.into_body()).await;
                    let steps = msg["batch"]["steps"].as_array().unwrap();
                    assert_eq!(steps.len(), 1);

                    let mut body = String::new();
                    for line in [
                        json!({"baton": null, "base_url": null}),
                        json!({"type": "step_begin", "step": 0, "cols": [{"name": "x"}]}),
                        json!({"type": "row", "row": [{"type": "integer", "value": "1"}]}),
                        json!({"type": "row", "row": [{"type": "integer", "value": "2"}]}),
                        json!({"type": "step_end", "affected_row_count": 0, "last_insert_rowid": null}),
                    ] {
                        body.push_str(&line.to_string());
                        body.push('\n');
                    }
                    Response::builder()
                        .status(200)
                        .body(Body::from(body))
                        .unwrap()
                }
                other => panic!("unexpected request: {other:?}"),
            }
        })
    });
    let (url, task) = spawn_server(handler);

    let client = http::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();

    let mut batch = Batch::new();
    batch.step("SELECT 1 AS x UNION ALL SELECT 2");
    let mut cursor = stream.cursor(batch).await.unwrap();

    use hrana_client::CursorEntry;
    assert!(matches!(
        cursor.next().await.unwrap().unwrap(),
        CursorEntry::StepBegin { step: 0, .. }
    ));
    for expected in [1, 2] {
        match cursor.next().await.unwrap().unwrap() {
            CursorEntry::Row(row) => assert_eq!(row[0], Value::Integer(expected)),
            other => panic!("unexpected entry: {other:?}"),
        }
    }
    assert!(matches!(
        cursor.next().await.unwrap().unwrap(),
        CursorEntry::StepEnd { .. }
    ));
    assert!(cursor.next().await.unwrap().is_none());
    cursor.close().await;

    task.abort();
}

#[tokio::test]
async fn error_statuses_are_mapped() {
    let handler: Handler = Arc::new(move |req| {
        Box::pin(async move {
            match (req.method().clone(), req.uri().path().to_string()) {
                (Method::GET, _) => not_found(),
                (Method::POST, path) if path == "/v2/pipeline" => {
                    let msg = read_json(req.into_body()).await;
                    let sql = msg["requests"][0]["stmt"]["sql"].as_str().unwrap_or("");
                    if sql.contains("boom") {
                        json_response(
                            400,
                            json!({"message": "no such table: boom", "code": "SQLITE_UNKNOWN"}),
                        )
                    } else {
                        Response::builder()
                            .status(503)
                            .body(Body::from("try later"))
                            .unwrap()
                    }
                }
                other => panic!("unexpected request: {other:?}"),
            }
        })
    });
    let (url, task) = spawn_server(handler);

    let client = http::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();

    let err = stream.query("SELECT * FROM boom").await.unwrap_err();
    match err {
        Error::Response(err) => {
            assert_eq!(err.message, "no such table: boom");
            assert_eq!(err.code.as_deref(), Some("SQLITE_UNKNOWN"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = stream.query("SELECT 1").await.unwrap_err();
    assert!(
        matches!(err, Error::HttpServer { status: 503 }),
        "unexpected error: {err}"
    );

    task.abort();
}

#[tokio::test]
async fn graceful_close_drains_and_closes() {
    let request_log: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let handler: Handler = {
        let request_log = request_log.clone();
        Arc::new(move |req| {
            let request_log = request_log.clone();
            Box::pin(async move {
                match (req.method().clone(), req.uri().path().to_string()) {
                    (Method::GET, path) if path == "/v3-protobuf" => not_found(),
                    (Method::GET, path) if path == "/v3" => json_response(200, json!({})),
                    (Method::POST, path) if path == "/v3/pipeline" => {
                        let msg = read_json(req.into_body()).await;
                        let requests = msg["requests"].as_array().unwrap().clone();
                        request_log.lock().push(
                            requests
                                .iter()
                                .map(|r| r["type"].as_str().unwrap().to_string())
                                .collect(),
                        );
                        let mut baton = json!("b");
                        let results: Vec<Json> = requests
                            .iter()
                            .map(|request| match request["type"].as_str().unwrap() {
                                "execute" => execute_ok(json!({"type": "integer", "value": "1"})),
                                "close" => {
                                    baton = Json::Null;
                                    json!({"type": "ok", "response": {"type": "close"}})
                                }
                                other => panic!("unexpected request type: {other}"),
                            })
                            .collect();
                        json_response(
                            200,
                            json!({"baton": baton, "base_url": null, "results": results}),
                        )
                    }
                    other => panic!("unexpected request: {other:?}"),
                }
            })
        })
    };
    let (url, task) = spawn_server(handler);

    let client = http::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();

    stream.query_value("SELECT 1").await.unwrap();
    stream.close_gracefully().await.unwrap();

    let err = stream.query_value("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)), "unexpected error: {err}");

    let log = request_log.lock().clone();
    assert_eq!(
        log,
        vec![vec!["execute".to_string()], vec!["close".to_string()]]
    );

    task.abort();
}

#[tokio::test]
async fn client_close_poisons_streams() {
    let handler: Handler = Arc::new(move |req| {
        Box::pin(async move {
            match req.method().clone() {
                Method::GET => not_found(),
                _ => panic!("unexpected request"),
            }
        })
    });
    let (url, task) = spawn_server(handler);

    let client = http::connect(&url, None).await.unwrap();
    let stream = client.open_stream().unwrap();
    client.close().await;

    let err = stream.query_value("SELECT 1").await.unwrap_err();
    match err {
        Error::Closed(cause) => {
            assert!(matches!(&*cause, Error::ClientClosed), "unexpected cause: {cause}")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(client.open_stream().is_err());

    task.abort();
}

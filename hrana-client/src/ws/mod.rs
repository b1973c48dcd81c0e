//! Hrana over a persistent WebSocket.
//!
//! The client negotiates a subprotocol (which fixes the protocol version
//! and the message encoding) during the WebSocket handshake, performs the
//! `hello` exchange, and then multiplexes any number of streams over the
//! single socket. A background task owns the socket and correlates
//! responses to requests by id.

mod conn;
mod stream;

use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use crate::id_alloc::IdAlloc;
use crate::proto::ws::{CloseSqlReq, OpenStreamReq, Request, Response, StoreSqlReq};
use crate::sql::ClientId;
use crate::util::coerce_ws_scheme;
use crate::{Encoding, Error, ProtocolError, Result, Sql, Version};

pub use stream::{CursorSource, Stream};

/// Subprotocols offered to the server, in order of preference.
const SUBPROTOCOLS: [(&str, Version, Encoding); 4] = [
    ("hrana3-protobuf", Version::Hrana3, Encoding::Protobuf),
    ("hrana3", Version::Hrana3, Encoding::Json),
    ("hrana2", Version::Hrana2, Encoding::Json),
    ("hrana1", Version::Hrana1, Encoding::Json),
];

/// Connects to `url` (any of `libsql:`, `ws:`, `wss:`, `http:`, `https:`)
/// and returns a client once the WebSocket handshake has completed. The
/// `hello` message carrying `jwt` is sent immediately; requests may be
/// submitted before the server confirms it.
pub async fn connect(url: &str, jwt: Option<String>) -> Result<Client> {
    let url = coerce_ws_scheme(url);
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| Error::WebSocket(err.to_string()))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static("hrana3-protobuf, hrana3, hrana2, hrana1"),
    );

    let (socket, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|err| Error::WebSocket(err.to_string()))?;

    let (version, encoding) = match response.headers().get("Sec-WebSocket-Protocol") {
        // No selected subprotocol means a server that predates negotiation.
        None => (Version::Hrana1, Encoding::Json),
        Some(selected) => {
            let token = selected.to_str().unwrap_or("").trim();
            SUBPROTOCOLS
                .iter()
                .find(|(name, _, _)| token.eq_ignore_ascii_case(name))
                .map(|(_, version, encoding)| (*version, *encoding))
                .ok_or_else(|| ProtocolError::UnknownSubprotocol(token.to_string()))?
        }
    };
    tracing::debug!("connected to {}: {} ({:?})", url, version, encoding);

    let (op_tx, op_rx) = mpsc::unbounded_channel();
    let close_cause = Arc::new(OnceLock::new());
    tokio::spawn(conn::run(
        socket,
        encoding,
        jwt,
        op_rx,
        close_cause.clone(),
    ));

    Ok(Client {
        inner: Arc::new(ClientInner {
            op_tx,
            version,
            encoding,
            client_id: ClientId::new(),
            stream_ids: parking_lot::Mutex::new(IdAlloc::new()),
            sql_ids: parking_lot::Mutex::new(IdAlloc::new()),
            cursor_ids: parking_lot::Mutex::new(IdAlloc::new()),
            close_cause,
        }),
    })
}

/// A Hrana client over a WebSocket.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    op_tx: mpsc::UnboundedSender<conn::Op>,
    version: Version,
    encoding: Encoding,
    client_id: ClientId,
    stream_ids: parking_lot::Mutex<IdAlloc>,
    sql_ids: parking_lot::Mutex<IdAlloc>,
    cursor_ids: parking_lot::Mutex<IdAlloc>,
    close_cause: Arc<OnceLock<Arc<Error>>>,
}

impl Client {
    /// The protocol version negotiated in the WebSocket handshake.
    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn encoding(&self) -> Encoding {
        self.inner.encoding
    }

    /// Resolves with the negotiated protocol version.
    pub async fn get_version(&self) -> Result<Version> {
        Ok(self.inner.version)
    }

    /// Opens a new stream. The stream is usable immediately; the server
    /// acknowledges the underlying id asynchronously, and a rejected open
    /// poisons the stream.
    pub fn open_stream(&self) -> Result<Stream> {
        if let Some(cause) = self.inner.close_cause.get() {
            return Err(Error::closed(cause.clone()));
        }
        let stream_id = self.inner.stream_ids.lock().alloc();
        let ack = self.enqueue(Request::OpenStream(OpenStreamReq { stream_id }));
        let stream = Stream::new(self.clone(), stream_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let monitored = stream.clone();
            handle.spawn(async move {
                if let Ok(Err(err)) = ack.await {
                    tracing::warn!("open_stream failed: {}", err);
                    monitored.poison(Arc::new(err));
                }
            });
        }
        Ok(stream)
    }

    /// Stores a SQL text on the server and returns a handle to it.
    /// Requires protocol version 2 or higher.
    pub async fn store_sql(&self, sql: impl Into<String>) -> Result<Sql> {
        self.inner.version.check(Version::Hrana2, "store_sql")?;
        let text: Arc<str> = sql.into().into();
        let sql_id = self.inner.sql_ids.lock().alloc();
        let result = self
            .request(Request::StoreSql(StoreSqlReq {
                sql_id,
                sql: text.to_string(),
            }))
            .await;
        match result {
            Ok(Response::StoreSql(_)) => {
                Ok(Sql::new(sql_id, text, self.inner.client_id.clone()))
            }
            Ok(other) => {
                self.inner.sql_ids.lock().free(sql_id);
                Err(stream::unexpected_response("store_sql", &other))
            }
            Err(err) => {
                self.inner.sql_ids.lock().free(sql_id);
                Err(err)
            }
        }
    }

    /// Closes a stored SQL text, releasing its id for reuse. Closing an
    /// already closed handle is a no-op.
    pub async fn close_sql(&self, sql: Sql) -> Result<()> {
        if !sql.begin_close(&self.inner.client_id)? {
            return Ok(());
        }
        let sql_id = sql.sql_id();
        let result = self.request(Request::CloseSql(CloseSqlReq { sql_id })).await;
        self.inner.sql_ids.lock().free(sql_id);
        match result? {
            Response::CloseSql(_) => Ok(()),
            other => Err(stream::unexpected_response("close_sql", &other)),
        }
    }

    /// Closes the client. All pending and future operations on the client
    /// and its streams fail with a closed error.
    pub async fn close(&self) {
        let _ = self.inner.op_tx.send(conn::Op::Close);
    }

    pub(crate) fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    /// Enqueues a request on the socket task. The send is synchronous, so
    /// two `enqueue` calls made in order are put on the wire in order.
    pub(crate) fn enqueue(&self, request: Request) -> oneshot::Receiver<Result<Response>> {
        let (done, rx) = oneshot::channel();
        let _ = self.inner.op_tx.send(conn::Op::Request { request, done });
        rx
    }

    pub(crate) async fn request(&self, request: Request) -> Result<Response> {
        match self.enqueue(request).await {
            Ok(result) => result,
            Err(_) => Err(self.closed_error()),
        }
    }

    pub(crate) fn closed_error(&self) -> Error {
        match self.inner.close_cause.get() {
            Some(cause) => Error::closed(cause.clone()),
            None => Error::closed(Arc::new(Error::ClientClosed)),
        }
    }

    pub(crate) fn free_stream_id(&self, stream_id: i32) {
        self.inner.stream_ids.lock().free(stream_id);
    }

    pub(crate) fn alloc_cursor_id(&self) -> i32 {
        self.inner.cursor_ids.lock().alloc()
    }

    pub(crate) fn free_cursor_id(&self, cursor_id: i32) {
        self.inner.cursor_ids.lock().free(cursor_id);
    }
}

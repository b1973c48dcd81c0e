//! Hrana over HTTP.
//!
//! Each stream is a chain of pipelined POST requests threaded by an opaque
//! baton; the server may also redirect the chain to a different base URL
//! between requests. The protocol version and the encoding are discovered
//! by probing the server's versioned endpoints at connect time.

mod cursor;
mod hyper;
mod stream;

use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::StreamExt as _;

use crate::id_alloc::IdAlloc;
use crate::proto::proto;
use crate::sql::ClientId;
use crate::util::coerce_http_scheme;
use crate::{Encoding, Error, Result, Sql, Version};

pub use self::hyper::{BodyStream, HttpSender};
pub use cursor::CursorSource;
pub use stream::Stream;

/// Narrow adapter over an HTTP implementation: a method, URL, headers and
/// body in; a status and a streaming byte body out.
pub trait HttpSend: Clone + Send + Sync + 'static {
    type Stream: futures::Stream<Item = Result<Bytes>> + Send + Unpin + 'static;

    fn http_send(
        &self,
        method: http::Method,
        url: Arc<str>,
        auth: Option<Arc<str>>,
        body: Bytes,
        content_type: &'static str,
    ) -> BoxFuture<'static, Result<HttpResponse<Self::Stream>>>;
}

pub struct HttpResponse<S> {
    pub status: http::StatusCode,
    pub body: S,
}

/// A versioned endpoint family of the server.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Endpoint {
    pub version: Version,
    pub encoding: Encoding,
    pub pipeline_path: &'static str,
    pub cursor_path: Option<&'static str>,
}

impl Endpoint {
    pub fn content_type(&self) -> &'static str {
        match self.encoding {
            Encoding::Json => "application/json",
            Encoding::Protobuf => "application/x-protobuf",
        }
    }
}

const ENDPOINT_V3_PROTOBUF: Endpoint = Endpoint {
    version: Version::Hrana3,
    encoding: Encoding::Protobuf,
    pipeline_path: "v3-protobuf/pipeline",
    cursor_path: Some("v3-protobuf/cursor"),
};

const ENDPOINT_V3: Endpoint = Endpoint {
    version: Version::Hrana3,
    encoding: Encoding::Json,
    pipeline_path: "v3/pipeline",
    cursor_path: Some("v3/cursor"),
};

const ENDPOINT_V2: Endpoint = Endpoint {
    version: Version::Hrana2,
    encoding: Encoding::Json,
    pipeline_path: "v2/pipeline",
    cursor_path: None,
};

/// Versioned endpoints probed at connect time, in order of preference.
/// Servers that support none of them are assumed to speak v2 with JSON.
const PROBED_ENDPOINTS: [(&str, Endpoint); 2] =
    [("v3-protobuf", ENDPOINT_V3_PROTOBUF), ("v3", ENDPOINT_V3)];

/// Connects to `url` (any of `libsql:`, `ws:`, `wss:`, `http:`, `https:`)
/// using the built-in hyper-based sender.
pub async fn connect(url: &str, auth_token: Option<&str>) -> Result<Client<HttpSender>> {
    Client::connect_with(url, auth_token, HttpSender::new()).await
}

/// A Hrana client over HTTP.
pub struct Client<T: HttpSend = HttpSender> {
    inner: Arc<ClientInner<T>>,
}

impl<T: HttpSend> Clone for Client<T> {
    fn clone(&self) -> Self {
        Client {
            inner: self.inner.clone(),
        }
    }
}

struct ClientInner<T> {
    sender: T,
    base_url: Arc<str>,
    auth: Option<Arc<str>>,
    endpoint: Endpoint,
    client_id: ClientId,
    sql_ids: parking_lot::Mutex<IdAlloc>,
    close_cause: OnceLock<Arc<Error>>,
}

impl<T: HttpSend> Client<T> {
    /// Connects with a custom sender, probing the server's versioned
    /// endpoints to select the protocol version and encoding.
    pub async fn connect_with(url: &str, auth_token: Option<&str>, sender: T) -> Result<Self> {
        let base_url: Arc<str> = coerce_http_scheme(url).into();
        let auth: Option<Arc<str>> = auth_token.map(|token| format!("Bearer {token}").into());
        let endpoint = probe_endpoint(&sender, &base_url, auth.as_ref()).await?;
        tracing::debug!(
            "connected to {}: {} ({:?})",
            base_url,
            endpoint.version,
            endpoint.encoding
        );
        Ok(Client {
            inner: Arc::new(ClientInner {
                sender,
                base_url,
                auth,
                endpoint,
                client_id: ClientId::new(),
                sql_ids: parking_lot::Mutex::new(IdAlloc::new()),
                close_cause: OnceLock::new(),
            }),
        })
    }

    /// The protocol version selected by the endpoint probe.
    pub fn version(&self) -> Version {
        self.inner.endpoint.version
    }

    pub fn encoding(&self) -> Encoding {
        self.inner.endpoint.encoding
    }

    /// Resolves with the negotiated protocol version.
    pub async fn get_version(&self) -> Result<Version> {
        Ok(self.version())
    }

    /// Opens a new stream. The server-side stream comes into existence
    /// with the first request sent on it.
    pub fn open_stream(&self) -> Result<Stream<T>> {
        self.check_open()?;
        Ok(Stream::new(self.clone()))
    }

    /// Allocates a SQL handle. Requires protocol version 2 or higher. The
    /// text is shipped to each stream that uses the handle before its
    /// first use there.
    pub async fn store_sql(&self, sql: impl Into<String>) -> Result<Sql> {
        self.version().check(Version::Hrana2, "store_sql")?;
        self.check_open()?;
        let text: Arc<str> = sql.into().into();
        let sql_id = self.inner.sql_ids.lock().alloc();
        Ok(Sql::new(sql_id, text, self.inner.client_id.clone()))
    }

    /// Closes a SQL handle, releasing its id for reuse. Streams that
    /// cached the text under a reused id re-store it on next use. Closing
    /// an already closed handle is a no-op.
    pub async fn close_sql(&self, sql: Sql) -> Result<()> {
        if sql.begin_close(&self.inner.client_id)? {
            self.inner.sql_ids.lock().free(sql.sql_id());
        }
        Ok(())
    }

    /// Closes the client; all streams fail with a closed error.
    pub async fn close(&self) {
        let _ = self.inner.close_cause.set(Arc::new(Error::ClientClosed));
    }

    pub(crate) fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    pub(crate) fn sender(&self) -> &T {
        &self.inner.sender
    }

    pub(crate) fn auth(&self) -> Option<Arc<str>> {
        self.inner.auth.clone()
    }

    pub(crate) fn base_url(&self) -> Arc<str> {
        self.inner.base_url.clone()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        match self.inner.close_cause.get() {
            None => Ok(()),
            Some(cause) => Err(Error::closed(cause.clone())),
        }
    }
}

async fn probe_endpoint<T: HttpSend>(
    sender: &T,
    base_url: &Arc<str>,
    auth: Option<&Arc<str>>,
) -> Result<Endpoint> {
    for (probe_path, endpoint) in PROBED_ENDPOINTS {
        let url: Arc<str> = format!("{base_url}/{probe_path}").into();
        let response = sender
            .http_send(
                http::Method::GET,
                url,
                auth.cloned(),
                Bytes::new(),
                "application/json",
            )
            .await?;
        if response.status.is_success() {
            return Ok(endpoint);
        }
    }
    Ok(ENDPOINT_V2)
}

/// Reads a whole response body into memory.
pub(crate) async fn collect_body<S>(mut body: S) -> Result<Bytes>
where
    S: futures::Stream<Item = Result<Bytes>> + Unpin,
{
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Checks the response status. Error statuses with a protocol error body
/// surface the server's message; anything else becomes a transport-level
/// error carrying the status.
pub(crate) async fn expect_ok<S>(response: HttpResponse<S>) -> Result<S>
where
    S: futures::Stream<Item = Result<Bytes>> + Unpin,
{
    if response.status.is_success() {
        return Ok(response.body);
    }
    let status = response.status.as_u16();
    let bytes = collect_body(response.body).await.unwrap_or_default();
    if let Ok(error) = serde_json::from_slice::<proto::Error>(&bytes) {
        return Err(Error::Response(error.into()));
    }
    Err(Error::HttpServer { status })
}

use std::sync::Arc;

use crate::proto::proto;
use crate::Version;

pub type Result<T> = std::result::Result<T, Error>;

/// Error produced by the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The client API was used in a way that violates its contract.
    #[error("client misuse: {0}")]
    Misuse(String),
    /// The server broke the protocol. These errors are fatal for the
    /// transport that produced them.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// A feature was used that the negotiated protocol version does not
    /// support.
    #[error(
        "{feature} is only supported in protocol version {min_version} and higher, \
         but the negotiated version is {version}"
    )]
    VersionNotSupported {
        feature: &'static str,
        min_version: Version,
        version: Version,
    },
    /// The server responded to an operation with an error.
    #[error("server returned an error: {0}")]
    Response(#[from] ResponseError),
    /// The WebSocket transport failed.
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// The HTTP server returned a non-success status without a protocol
    /// error body.
    #[error("http server returned status {status}")]
    HttpServer { status: u16 },
    /// The HTTP transport failed before a response was received.
    #[error("http transport error: {0}")]
    HttpTransport(String),
    /// A value could not be represented in the requested form.
    #[error("value out of range: {0}")]
    Range(String),
    /// The client, stream or cursor is closed. Carries the error that
    /// caused it to close.
    #[error("closed: {0}")]
    Closed(#[source] Arc<Error>),
    /// The client was closed by the user.
    #[error("the client was closed by the user")]
    ClientClosed,
    /// The stream was closed by the user or by the server.
    #[error("the stream is closed")]
    StreamClosed,
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn closed(cause: Arc<Error>) -> Error {
        Error::Closed(cause)
    }

    pub(crate) fn stream_closed() -> Error {
        Error::Closed(Arc::new(Error::StreamClosed))
    }
}

/// An unrecoverable protocol error. A correct server should never trigger
/// any of these; they close the transport that produced them.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("cannot deserialize server message from JSON: {source}")]
    JsonDeserialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("could not decode server message from protobuf: {source}")]
    ProtobufDecode {
        #[source]
        source: prost::DecodeError,
    },
    #[error("received a binary WebSocket message, but the negotiated encoding is JSON")]
    BinaryWebSocketMessage,
    #[error("received a text WebSocket message, but the negotiated encoding is binary")]
    TextWebSocketMessage,
    #[error("server selected unknown WebSocket subprotocol {0:?}")]
    UnknownSubprotocol(String),
    #[error("received a second hello response")]
    DuplicateHello,
    #[error("received a response before the hello response")]
    ResponseBeforeHello,
    #[error("received a response with unexpected request id {request_id}")]
    UnexpectedRequestId { request_id: i32 },
    #[error("received a response of type {got:?} to a request of type {expected:?}")]
    ResponseMismatch {
        expected: &'static str,
        got: &'static str,
    },
    #[error("expected {expected} results in pipeline response, received {got}")]
    PipelineLengthMismatch { expected: usize, got: usize },
    #[error("server message type not recognized")]
    NoneServerMsg,
    #[error("response type not recognized")]
    NoneResponse,
    #[error("stream result type not recognized")]
    NoneStreamResult,
    #[error("value type not recognized")]
    NoneValue,
    #[error("cursor entry type not recognized")]
    NoneCursorEntry,
    #[error("cursor entry received out of order")]
    CursorEntryOutOfOrder,
    #[error("cursor response body was truncated")]
    TruncatedCursorBody,
    #[error("batch step {step} has both a result and an error")]
    BatchStepMismatch { step: usize },
}

/// Error reported by the server in response to an operation. Step errors in
/// a batch and cursor step errors use the same representation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ResponseError {
    pub message: String,
    pub code: Option<String>,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::HttpTransport(err.to_string())
    }
}

impl From<proto::Error> for ResponseError {
    fn from(error: proto::Error) -> Self {
        ResponseError {
            message: error.message,
            code: error.code,
        }
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::{watch, OwnedMutexGuard};

use super::Client;
use crate::batch::{Batch, BatchResults};
use crate::cursor::{Cursor, RawCursor};
use crate::proto::proto::{self, DescribeResult};
use crate::proto::ws::{
    BatchReq, CloseCursorReq, CloseStreamReq, DescribeReq, ExecuteReq, FetchCursorReq,
    GetAutocommitReq, OpenCursorReq, Request, Response, SequenceReq,
};
use crate::result::{ResultSet, Row};
use crate::statement::{SqlDescriptor, Statement};
use crate::value::{IntMode, Value};
use crate::{Error, ProtocolError, Result, Version};

/// How many cursor entries are requested from the server in one
/// `fetch_cursor` round trip.
const FETCH_CURSOR_WINDOW: u32 = 128;

/// An interactive SQL stream multiplexed over the WebSocket.
///
/// Requests on one stream are serialized: at most one request is in flight
/// at a time and queued requests run in submission order, because the
/// server-side SQL connection is stateful. Requests on different streams
/// interleave freely.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    client: Client,
    stream_id: i32,
    int_mode: parking_lot::Mutex<IntMode>,
    serial: Arc<tokio::sync::Mutex<()>>,
    status: parking_lot::Mutex<Status>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    close_cause: OnceLock<Arc<Error>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Status {
    Open,
    Closing,
    Closed,
}

impl Stream {
    pub(super) fn new(client: Client, stream_id: i32) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Stream {
            inner: Arc::new(StreamInner {
                client,
                stream_id,
                int_mode: parking_lot::Mutex::new(IntMode::default()),
                serial: Arc::new(tokio::sync::Mutex::new(())),
                status: parking_lot::Mutex::new(Status::Open),
                closed_tx,
                closed_rx,
                close_cause: OnceLock::new(),
            }),
        }
    }

    /// The client-allocated id of this stream.
    pub fn stream_id(&self) -> i32 {
        self.inner.stream_id
    }

    /// How integers in results decoded on this stream are represented.
    pub fn int_mode(&self) -> IntMode {
        *self.inner.int_mode.lock()
    }

    pub fn set_int_mode(&self, int_mode: IntMode) {
        *self.inner.int_mode.lock() = int_mode;
    }

    /// Executes a statement with its own `want_rows` setting.
    pub async fn execute(&self, stmt: impl Into<Statement>) -> Result<ResultSet> {
        self.execute_inner(stmt.into()).await
    }

    /// Executes a statement and returns its rows.
    pub async fn query(&self, stmt: impl Into<Statement>) -> Result<ResultSet> {
        let mut stmt = stmt.into();
        stmt.set_want_rows(true);
        self.execute_inner(stmt).await
    }

    /// Executes a statement and returns its first row, if any.
    pub async fn query_row(&self, stmt: impl Into<Statement>) -> Result<Option<Row>> {
        Ok(self.query(stmt).await?.into_first_row())
    }

    /// Executes a statement and returns the first value of its first row,
    /// if any.
    pub async fn query_value(&self, stmt: impl Into<Statement>) -> Result<Option<Value>> {
        Ok(self.query(stmt).await?.into_first_value())
    }

    /// Executes a statement without fetching rows.
    pub async fn run(&self, stmt: impl Into<Statement>) -> Result<ResultSet> {
        let mut stmt = stmt.into();
        stmt.set_want_rows(false);
        self.execute_inner(stmt).await
    }

    async fn execute_inner(&self, stmt: Statement) -> Result<ResultSet> {
        let int_mode = self.int_mode();
        let (stmt, _) = stmt.into_proto(self.inner.client.client_id())?;
        let response = self
            .stream_request(Request::Execute(ExecuteReq {
                stream_id: self.inner.stream_id,
                stmt,
            }))
            .await?;
        match response {
            Response::Execute(resp) => ResultSet::from_proto(resp.result, int_mode),
            other => Err(unexpected_response("execute", &other)),
        }
    }

    /// Executes a batch and returns the per-step outcomes.
    pub async fn batch(&self, batch: Batch) -> Result<BatchResults> {
        self.inner
            .client
            .version()
            .check(batch.min_version(), "batch condition")?;
        let int_mode = self.int_mode();
        let (batch, _) = batch.into_proto(self.inner.client.client_id())?;
        let response = self
            .stream_request(Request::Batch(BatchReq {
                stream_id: self.inner.stream_id,
                batch,
            }))
            .await?;
        match response {
            Response::Batch(resp) => BatchResults::from_proto(resp.result, int_mode),
            other => Err(unexpected_response("batch", &other)),
        }
    }

    /// Executes a batch through a streaming cursor. Requires protocol
    /// version 3. While the cursor is open, all other requests on this
    /// stream wait for it to close.
    pub async fn cursor(&self, batch: Batch) -> Result<Cursor<CursorSource>> {
        self.inner.client.version().check(Version::Hrana3, "cursor")?;
        self.inner
            .client
            .version()
            .check(batch.min_version(), "batch condition")?;
        let int_mode = self.int_mode();
        let (batch, _) = batch.into_proto(self.inner.client.client_id())?;

        self.check_accepting()?;
        let guard = self.lock_serial_owned().await?;
        let cursor_id = self.inner.client.alloc_cursor_id();
        let result = self
            .send_on_wire(Request::OpenCursor(OpenCursorReq {
                stream_id: self.inner.stream_id,
                cursor_id,
                batch,
            }))
            .await;
        match result {
            Ok(Response::OpenCursor(_)) => {
                let source = CursorSource {
                    client: self.inner.client.clone(),
                    closed_rx: self.inner.closed_rx.clone(),
                    cursor_id,
                    entries: VecDeque::new(),
                    done: false,
                    closed: false,
                    _guard: Some(guard),
                };
                Ok(Cursor::new(source, int_mode))
            }
            Ok(other) => {
                self.inner.client.free_cursor_id(cursor_id);
                Err(unexpected_response("open_cursor", &other))
            }
            Err(err) => {
                self.inner.client.free_cursor_id(cursor_id);
                Err(err)
            }
        }
    }

    /// Describes a statement. Requires protocol version 2.
    pub async fn describe(&self, sql: impl SqlDescriptor) -> Result<DescribeResult> {
        self.inner.client.version().check(Version::Hrana2, "describe")?;
        let (sql, sql_id, _) = sql
            .sql_description()
            .into_parts(self.inner.client.client_id())?;
        let response = self
            .stream_request(Request::Describe(DescribeReq {
                stream_id: self.inner.stream_id,
                sql,
                sql_id,
            }))
            .await?;
        match response {
            Response::Describe(resp) => Ok(resp.result),
            other => Err(unexpected_response("describe", &other)),
        }
    }

    /// Executes a sequence of SQL statements separated by semicolons.
    /// Requires protocol version 2.
    pub async fn sequence(&self, sql: impl SqlDescriptor) -> Result<()> {
        self.inner.client.version().check(Version::Hrana2, "sequence")?;
        let (sql, sql_id, _) = sql
            .sql_description()
            .into_parts(self.inner.client.client_id())?;
        let response = self
            .stream_request(Request::Sequence(SequenceReq {
                stream_id: self.inner.stream_id,
                sql,
                sql_id,
            }))
            .await?;
        match response {
            Response::Sequence(_) => Ok(()),
            other => Err(unexpected_response("sequence", &other)),
        }
    }

    /// Whether the stream's connection is in autocommit mode. Requires
    /// protocol version 3.
    pub async fn get_autocommit(&self) -> Result<bool> {
        self.inner
            .client
            .version()
            .check(Version::Hrana3, "get_autocommit")?;
        let response = self
            .stream_request(Request::GetAutocommit(GetAutocommitReq {
                stream_id: self.inner.stream_id,
            }))
            .await?;
        match response {
            Response::GetAutocommit(resp) => Ok(resp.is_autocommit),
            other => Err(unexpected_response("get_autocommit", &other)),
        }
    }

    /// Closes the stream immediately. Queued and in-flight operations fail
    /// with a closed error; the stream id is released.
    pub fn close(&self) {
        self.inner.close(Arc::new(Error::StreamClosed), true);
    }

    /// Stops accepting new work, waits for queued operations to drain, and
    /// then closes the stream.
    pub async fn close_gracefully(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock();
            match *status {
                Status::Closed => return Ok(()),
                Status::Closing => return Err(self.closed_error()),
                Status::Open => *status = Status::Closing,
            }
        }
        let _guard = self.inner.serial.lock().await;
        let result = self
            .inner
            .client
            .request(Request::CloseStream(CloseStreamReq {
                stream_id: self.inner.stream_id,
            }))
            .await;
        self.inner.close(Arc::new(Error::StreamClosed), false);
        match result? {
            Response::CloseStream(_) => Ok(()),
            other => Err(unexpected_response("close_stream", &other)),
        }
    }

    pub(super) fn poison(&self, cause: Arc<Error>) {
        self.inner.close(cause, false);
    }

    async fn stream_request(&self, request: Request) -> Result<Response> {
        self.check_accepting()?;
        let _guard = self.lock_serial().await?;
        self.send_on_wire(request).await
    }

    fn check_accepting(&self) -> Result<()> {
        match *self.inner.status.lock() {
            Status::Open => Ok(()),
            Status::Closing | Status::Closed => Err(self.closed_error()),
        }
    }

    async fn lock_serial(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        let mut closed = self.inner.closed_rx.clone();
        let closed_check = closed.clone();
        tokio::select! {
            guard = self.inner.serial.lock() => {
                let is_closed = *closed_check.borrow();
                if is_closed {
                    Err(self.closed_error())
                } else {
                    Ok(guard)
                }
            }
            _ = closed.wait_for(|closed| *closed) => Err(self.closed_error()),
        }
    }

    async fn lock_serial_owned(&self) -> Result<OwnedMutexGuard<()>> {
        let mut closed = self.inner.closed_rx.clone();
        let closed_check = closed.clone();
        let serial = self.inner.serial.clone();
        tokio::select! {
            guard = serial.lock_owned() => {
                let is_closed = *closed_check.borrow();
                if is_closed {
                    Err(self.closed_error())
                } else {
                    Ok(guard)
                }
            }
            _ = closed.wait_for(|closed| *closed) => Err(self.closed_error()),
        }
    }

    async fn send_on_wire(&self, request: Request) -> Result<Response> {
        let mut closed = self.inner.closed_rx.clone();
        tokio::select! {
            result = self.inner.client.request(request) => result,
            _ = closed.wait_for(|closed| *closed) => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> Error {
        match self.inner.close_cause.get() {
            Some(cause) => Error::closed(cause.clone()),
            None => Error::stream_closed(),
        }
    }
}

impl StreamInner {
    fn close(&self, cause: Arc<Error>, notify_server: bool) {
        {
            let mut status = self.status.lock();
            if *status == Status::Closed {
                return;
            }
            *status = Status::Closed;
        }
        let _ = self.close_cause.set(cause);
        let _ = self.closed_tx.send(true);
        if notify_server {
            // The ack is intentionally dropped; the conn task still ships
            // the request, and ordering guarantees that a reallocated
            // stream id cannot overtake this close on the wire.
            let _ = self.client.enqueue(Request::CloseStream(CloseStreamReq {
                stream_id: self.stream_id,
            }));
        }
        self.client.free_stream_id(self.stream_id);
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        let status = *self.status.lock();
        if status != Status::Closed {
            let _ = self.client.enqueue(Request::CloseStream(CloseStreamReq {
                stream_id: self.stream_id,
            }));
            self.client.free_stream_id(self.stream_id);
        }
    }
}

pub(crate) fn unexpected_response(expected: &'static str, got: &Response) -> Error {
    Error::Protocol(ProtocolError::ResponseMismatch {
        expected,
        got: got.type_name(),
    })
}

/// Entries of a WebSocket cursor, fetched in windows with `fetch_cursor`.
pub struct CursorSource {
    client: Client,
    closed_rx: watch::Receiver<bool>,
    cursor_id: i32,
    entries: VecDeque<proto::CursorEntry>,
    done: bool,
    closed: bool,
    _guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl RawCursor for CursorSource {
    async fn next_entry(&mut self) -> Result<Option<proto::CursorEntry>> {
        loop {
            if let Some(entry) = self.entries.pop_front() {
                return Ok(Some(entry));
            }
            if self.done || self.closed {
                return Ok(None);
            }
            let mut closed = self.closed_rx.clone();
            let request = self.client.request(Request::FetchCursor(FetchCursorReq {
                cursor_id: self.cursor_id,
                max_count: FETCH_CURSOR_WINDOW,
            }));
            let response = tokio::select! {
                result = request => result?,
                _ = closed.wait_for(|closed| *closed) => return Err(Error::stream_closed()),
            };
            match response {
                Response::FetchCursor(resp) => {
                    self.done = resp.done;
                    self.entries.extend(resp.entries);
                }
                other => return Err(unexpected_response("fetch_cursor", &other)),
            }
        }
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl CursorSource {
    /// Releases the server-side cursor and unblocks the stream. Idempotent.
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.client.enqueue(Request::CloseCursor(CloseCursorReq {
            cursor_id: self.cursor_id,
        }));
        self.client.free_cursor_id(self.cursor_id);
        self._guard = None;
    }
}

impl Drop for CursorSource {
    fn drop(&mut self) {
        self.release();
    }
}

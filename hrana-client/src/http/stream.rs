use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::{watch, OwnedMutexGuard};

use super::cursor::{open_cursor, CursorSource};
use super::{collect_body, expect_ok, Client, Endpoint, HttpSend};
use crate::batch::{Batch, BatchResults};
use crate::cursor::Cursor;
use crate::proto::http::{
    BatchStreamReq, CloseSqlStreamReq, CloseStreamReq, DescribeStreamReq, ExecuteStreamReq,
    GetAutocommitStreamReq, PipelineReqBody, PipelineRespBody, SequenceStreamReq,
    StoreSqlStreamReq, StreamRequest, StreamResponse, StreamResult,
};
use crate::proto::proto::DescribeResult;
use crate::result::{ResultSet, Row};
use crate::sql::SqlInner;
use crate::statement::{SqlDescriptor, Statement};
use crate::value::{IntMode, Value};
use crate::{Encoding, Error, ProtocolError, Result, Version};

/// An interactive SQL stream over HTTP: a chain of pipelined requests
/// threaded by the baton.
///
/// Requests on one stream are serialized because the baton is a single
/// chain; requests on different streams run concurrently.
pub struct Stream<T: HttpSend> {
    inner: Arc<StreamInner<T>>,
}

impl<T: HttpSend> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Stream {
            inner: self.inner.clone(),
        }
    }
}

struct StreamInner<T: HttpSend> {
    client: Client<T>,
    int_mode: parking_lot::Mutex<IntMode>,
    serial: Arc<tokio::sync::Mutex<RawStream<T>>>,
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

/// The baton chain and everything needed to send the next request on it.
pub(super) struct RawStream<T: HttpSend> {
    pub sender: T,
    pub auth: Option<Arc<str>>,
    pub encoding: Encoding,
    pub endpoint: Endpoint,
    pub baton: Option<String>,
    pub pipeline_url: Arc<str>,
    pub cursor_url: Option<Arc<str>>,
    /// Set when the server ended the chain by not returning a baton.
    pub server_closed: bool,
    /// SQL texts this stream has stored, by id. Identity of the text is
    /// tracked so a reused id gets re-stored.
    pub known_sqls: HashMap<i32, Arc<str>>,
}

impl<T: HttpSend> Stream<T> {
    pub(super) fn new(client: Client<T>) -> Self {
        let endpoint = client.endpoint();
        let base_url = client.base_url();
        let (closed_tx, closed_rx) = watch::channel(false);
        let raw = RawStream {
            sender: client.sender().clone(),
            auth: client.auth(),
            encoding: endpoint.encoding,
            endpoint,
            baton: None,
            pipeline_url: format!("{}/{}", base_url, endpoint.pipeline_path).into(),
            cursor_url: endpoint
                .cursor_path
                .map(|path| format!("{base_url}/{path}").into()),
            server_closed: false,
            known_sqls: HashMap::new(),
        };
        Stream {
            inner: Arc::new(StreamInner {
                client,
                int_mode: parking_lot::Mutex::new(IntMode::default()),
                serial: Arc::new(tokio::sync::Mutex::new(raw)),
                status: parking_lot::Mutex::new(Status::Open),
                closed_tx,
                closed_rx,
                close_cause: OnceLock::new(),
            }),
        }
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
        let (stmt, stored) = stmt.into_proto(self.inner.client.client_id())?;
        let stored: Vec<_> = stored.into_iter().collect();
        let response = self
            .op(
                StreamRequest::Execute(ExecuteStreamReq { stmt }),
                &stored,
            )
            .await?;
        match response {
            StreamResponse::Execute(resp) => ResultSet::from_proto(resp.result, int_mode),
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
        let (batch, stored) = batch.into_proto(self.inner.client.client_id())?;
        let response = self
            .op(StreamRequest::Batch(BatchStreamReq { batch }), &stored)
            .await?;
        match response {
            StreamResponse::Batch(resp) => BatchResults::from_proto(resp.result, int_mode),
            other => Err(unexpected_response("batch", &other)),
        }
    }

    /// Executes a batch through a streaming cursor. Requires protocol
    /// version 3. The cursor monopolizes this stream until its body is
    /// consumed or it is closed.
    pub async fn cursor(&self, batch: Batch) -> Result<Cursor<CursorSource<T>>> {
        self.inner.client.version().check(Version::Hrana3, "cursor")?;
        self.inner
            .client
            .version()
            .check(batch.min_version(), "batch condition")?;
        let int_mode = self.int_mode();
        let (batch, stored) = batch.into_proto(self.inner.client.client_id())?;

        self.check_accepting()?;
        self.inner.client.check_open()?;
        let mut guard = self.lock_serial_owned().await?;
        if !stored.is_empty() {
            let (prelude, updates) = guard.sql_prelude(&stored);
            if !prelude.is_empty() {
                guard.send_requests(prelude).await?;
                guard.note_stored(updates);
            }
        }
        let source = open_cursor(guard, batch).await?;
        Ok(Cursor::new(source, int_mode))
    }

    /// Describes a statement. Requires protocol version 2.
    pub async fn describe(&self, sql: impl SqlDescriptor) -> Result<DescribeResult> {
        self.inner.client.version().check(Version::Hrana2, "describe")?;
        let (sql, sql_id, stored) = sql
            .sql_description()
            .into_parts(self.inner.client.client_id())?;
        let stored: Vec<_> = stored.into_iter().collect();
        let response = self
            .op(
                StreamRequest::Describe(DescribeStreamReq { sql, sql_id }),
                &stored,
            )
            .await?;
        match response {
            StreamResponse::Describe(resp) => Ok(resp.result),
            other => Err(unexpected_response("describe", &other)),
        }
    }

    /// Executes a sequence of SQL statements separated by semicolons.
    /// Requires protocol version 2.
    pub async fn sequence(&self, sql: impl SqlDescriptor) -> Result<()> {
        self.inner.client.version().check(Version::Hrana2, "sequence")?;
        let (sql, sql_id, stored) = sql
            .sql_description()
            .into_parts(self.inner.client.client_id())?;
        let stored: Vec<_> = stored.into_iter().collect();
        let response = self
            .op(
                StreamRequest::Sequence(SequenceStreamReq { sql, sql_id }),
                &stored,
            )
            .await?;
        match response {
            StreamResponse::Sequence(_) => Ok(()),
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
            .op(
                StreamRequest::GetAutocommit(GetAutocommitStreamReq {}),
                &[],
            )
            .await?;
        match response {
            StreamResponse::GetAutocommit(resp) => Ok(resp.is_autocommit),
            other => Err(unexpected_response("get_autocommit", &other)),
        }
    }

    /// Closes the stream immediately. Queued and in-flight operations fail
    /// with a closed error; the server is notified in the background.
    pub fn close(&self) {
        if !self.inner.begin_close(Arc::new(Error::StreamClosed)) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let serial = self.inner.serial.clone();
            handle.spawn(async move {
                let mut raw = serial.lock().await;
                raw.close_on_server().await;
            });
        }
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
        let mut raw = self.inner.serial.lock().await;
        let result = if raw.server_closed || raw.baton.is_none() {
            Ok(())
        } else {
            raw.send_requests(vec![StreamRequest::Close(CloseStreamReq {})])
                .await
                .map(drop)
        };
        drop(raw);
        self.inner.begin_close(Arc::new(Error::StreamClosed));
        result
    }

    async fn op(
        &self,
        request: StreamRequest,
        stored: &[Arc<SqlInner>],
    ) -> Result<StreamResponse> {
        self.check_accepting()?;
        self.inner.client.check_open()?;
        let mut guard = self.lock_serial().await?;
        let mut closed = self.inner.closed_rx.clone();
        tokio::select! {
            result = guard.send(request, stored) => result,
            _ = closed.wait_for(|closed| *closed) => Err(self.closed_error()),
        }
    }

    fn check_accepting(&self) -> Result<()> {
        match *self.inner.status.lock() {
            Status::Open => Ok(()),
            Status::Closing | Status::Closed => Err(self.closed_error()),
        }
    }

    async fn lock_serial(&self) -> Result<tokio::sync::MutexGuard<'_, RawStream<T>>> {
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

    async fn lock_serial_owned(&self) -> Result<OwnedMutexGuard<RawStream<T>>> {
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

    fn closed_error(&self) -> Error {
        match self.inner.close_cause.get() {
            Some(cause) => Error::closed(cause.clone()),
            None => Error::stream_closed(),
        }
    }
}

impl<T: HttpSend> StreamInner<T> {
    /// Marks the stream closed. Returns false when it already was.
    fn begin_close(&self, cause: Arc<Error>) -> bool {
        {
            let mut status = self.status.lock();
            if *status == Status::Closed {
                return false;
            }
            *status = Status::Closed;
        }
        let _ = self.close_cause.set(cause);
        let _ = self.closed_tx.send(true);
        true
    }
}

impl<T: HttpSend> Drop for StreamInner<T> {
    fn drop(&mut self) {
        if *self.status.lock() == Status::Closed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let serial = self.serial.clone();
            handle.spawn(async move {
                let mut raw = serial.lock().await;
                raw.close_on_server().await;
            });
        }
    }
}

impl<T: HttpSend> RawStream<T> {
    /// Sends one request on the baton chain, preceded by `store_sql`
    /// requests for handles this stream does not hold yet.
    pub(super) async fn send(
        &mut self,
        request: StreamRequest,
        stored: &[Arc<SqlInner>],
    ) -> Result<StreamResponse> {
        let (mut requests, updates) = self.sql_prelude(stored);
        requests.push(request);
        let mut responses = self.send_requests(requests).await?;
        self.note_stored(updates);
        responses
            .pop()
            .ok_or_else(|| Error::Internal("pipeline response was empty".into()))
    }

    /// Store (and when an id was reused, close) requests for the SQL
    /// handles that this stream has not shipped yet.
    pub(super) fn sql_prelude(
        &self,
        stored: &[Arc<SqlInner>],
    ) -> (Vec<StreamRequest>, Vec<(i32, Arc<str>)>) {
        let mut requests = Vec::new();
        let mut updates = Vec::new();
        for sql in stored {
            match self.known_sqls.get(&sql.sql_id) {
                Some(text) if Arc::ptr_eq(text, &sql.text) => continue,
                Some(_) => {
                    requests.push(StreamRequest::CloseSql(CloseSqlStreamReq {
                        sql_id: sql.sql_id,
                    }));
                }
                None => {}
            }
            requests.push(StreamRequest::StoreSql(StoreSqlStreamReq {
                sql_id: sql.sql_id,
                sql: sql.text.to_string(),
            }));
            updates.push((sql.sql_id, sql.text.clone()));
        }
        (requests, updates)
    }

    pub(super) fn note_stored(&mut self, updates: Vec<(i32, Arc<str>)>) {
        for (sql_id, text) in updates {
            self.known_sqls.insert(sql_id, text);
        }
    }

    pub(super) async fn send_requests(
        &mut self,
        requests: Vec<StreamRequest>,
    ) -> Result<Vec<StreamResponse>> {
        if self.server_closed {
            return Err(Error::stream_closed());
        }
        let expected = requests.len();
        let body = PipelineReqBody {
            baton: self.baton.clone(),
            requests,
        };
        let bytes = match self.encoding {
            Encoding::Json => Bytes::from(
                serde_json::to_vec(&body)
                    .map_err(|err| Error::Internal(format!("could not serialize request: {err}")))?,
            ),
            Encoding::Protobuf => {
                Bytes::from(<PipelineReqBody as prost::Message>::encode_to_vec(&body))
            }
        };
        tracing::trace!(
            "sending {} pipeline requests with baton {:?}",
            expected,
            self.baton
        );
        let response = self
            .sender
            .http_send(
                http::Method::POST,
                self.pipeline_url.clone(),
                self.auth.clone(),
                bytes,
                self.endpoint.content_type(),
            )
            .await?;
        let body = expect_ok(response).await?;
        let bytes = collect_body(body).await?;
        let response: PipelineRespBody = match self.encoding {
            Encoding::Json => serde_json::from_slice(&bytes)
                .map_err(|source| ProtocolError::JsonDeserialize { source })?,
            Encoding::Protobuf => <PipelineRespBody as prost::Message>::decode(bytes.as_ref())
                .map_err(|source| ProtocolError::ProtobufDecode { source })?,
        };
        if let Some(base_url) = response.base_url {
            self.update_base_url(&base_url);
        }
        match response.baton {
            Some(baton) => self.baton = Some(baton),
            None => {
                tracing::trace!("server closed the stream");
                self.baton = None;
                self.server_closed = true;
            }
        }
        if response.results.len() != expected {
            return Err(ProtocolError::PipelineLengthMismatch {
                expected,
                got: response.results.len(),
            }
            .into());
        }
        response
            .results
            .into_iter()
            .map(|result| match result {
                StreamResult::None => Err(ProtocolError::NoneStreamResult.into()),
                StreamResult::Ok {
                    response: StreamResponse::None,
                } => Err(ProtocolError::NoneResponse.into()),
                StreamResult::Ok { response } => Ok(response),
                StreamResult::Error { error } => Err(Error::Response(error.into())),
            })
            .collect()
    }

    pub(super) fn update_base_url(&mut self, base_url: &str) {
        let base = base_url.trim_end_matches('/');
        self.pipeline_url = format!("{}/{}", base, self.endpoint.pipeline_path).into();
        self.cursor_url = self
            .endpoint
            .cursor_path
            .map(|path| format!("{base}/{path}").into());
    }

    /// Best-effort close of the server-side stream.
    pub(super) async fn close_on_server(&mut self) {
        if self.server_closed || self.baton.is_none() {
            return;
        }
        if let Err(err) = self
            .send_requests(vec![StreamRequest::Close(CloseStreamReq {})])
            .await
        {
            tracing::debug!("could not close stream on the server: {}", err);
        }
        self.server_closed = true;
    }
}

pub(super) fn unexpected_response(expected: &'static str, got: &StreamResponse) -> Error {
    Error::Protocol(ProtocolError::ResponseMismatch {
        expected,
        got: got.type_name(),
    })
}

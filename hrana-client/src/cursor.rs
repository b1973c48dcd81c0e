use std::sync::Arc;

use async_trait::async_trait;

use crate::proto::proto;
use crate::result::Row;
use crate::value::IntMode;
use crate::{ProtocolError, ResponseError, Result};

/// Source of raw cursor entries. The WebSocket transport fetches windows of
/// entries with `fetch_cursor`; the HTTP transport parses them out of a
/// streaming response body.
#[async_trait]
pub trait RawCursor: Send {
    async fn next_entry(&mut self) -> Result<Option<proto::CursorEntry>>;

    /// Releases the cursor eagerly. Must be idempotent.
    async fn close(&mut self);
}

/// Entry yielded by a [`Cursor`].
#[derive(Debug)]
pub enum CursorEntry {
    /// A new step started producing entries. Rows that follow belong to it.
    StepBegin {
        step: u32,
        cols: Arc<Vec<proto::Col>>,
    },
    /// A row of the current step.
    Row(Row),
    /// The current step finished.
    StepEnd {
        affected_row_count: u64,
        last_insert_rowid: Option<i64>,
    },
    /// The step failed; no further entries for it will arrive.
    StepError { step: u32, error: ResponseError },
}

/// A lazy, finite, non-restartable sequence of cursor entries produced by
/// executing a batch. Reads are sequential; closing is idempotent and
/// releases the server-side cursor eagerly.
pub struct Cursor<R> {
    raw: R,
    int_mode: IntMode,
    cols: Option<Arc<Vec<proto::Col>>>,
    done: bool,
}

impl<R: RawCursor> Cursor<R> {
    pub(crate) fn new(raw: R, int_mode: IntMode) -> Self {
        Cursor {
            raw,
            int_mode,
            cols: None,
            done: false,
        }
    }

    /// Next entry of the cursor, or `None` when the batch is exhausted.
    ///
    /// A terminal cursor error surfaces as `Err` and ends the cursor; step
    /// errors are ordinary entries and do not.
    pub async fn next(&mut self) -> Result<Option<CursorEntry>> {
        if self.done {
            return Ok(None);
        }
        let entry = match self.raw.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.done = true;
                return Ok(None);
            }
            Err(err) => {
                self.done = true;
                self.raw.close().await;
                return Err(err);
            }
        };
        match entry {
            proto::CursorEntry::None => {
                self.done = true;
                self.raw.close().await;
                Err(ProtocolError::NoneCursorEntry.into())
            }
            proto::CursorEntry::StepBegin(begin) => {
                let cols = Arc::new(begin.cols);
                self.cols = Some(cols.clone());
                Ok(Some(CursorEntry::StepBegin {
                    step: begin.step,
                    cols,
                }))
            }
            proto::CursorEntry::Row { row } => {
                let Some(cols) = self.cols.clone() else {
                    self.done = true;
                    self.raw.close().await;
                    return Err(ProtocolError::CursorEntryOutOfOrder.into());
                };
                let row = Row::from_proto(cols, row, self.int_mode)?;
                Ok(Some(CursorEntry::Row(row)))
            }
            proto::CursorEntry::StepEnd(end) => {
                self.cols = None;
                Ok(Some(CursorEntry::StepEnd {
                    affected_row_count: end.affected_row_count,
                    last_insert_rowid: end.last_insert_rowid,
                }))
            }
            proto::CursorEntry::StepError(step_error) => {
                self.cols = None;
                Ok(Some(CursorEntry::StepError {
                    step: step_error.step,
                    error: step_error.error.into(),
                }))
            }
            proto::CursorEntry::Error { error } => {
                self.done = true;
                self.raw.close().await;
                Err(crate::Error::Response(error.into()))
            }
        }
    }

    /// Closes the cursor, releasing the server-side resources and any
    /// requests blocked on the owning stream.
    pub async fn close(&mut self) {
        self.done = true;
        self.raw.close().await;
    }
}

use std::ops::Index;
use std::sync::Arc;

use crate::proto::proto;
use crate::value::{from_proto, FromValue, IntMode, Value};
use crate::{Error, Result};

/// Result of executing a statement: column descriptors, rows (when the
/// statement was executed with `want_rows`), and the update counters.
#[derive(Debug, Clone)]
pub struct ResultSet {
    cols: Arc<Vec<proto::Col>>,
    rows: Vec<Row>,
    pub affected_row_count: u64,
    pub last_insert_rowid: Option<i64>,
}

impl ResultSet {
    pub(crate) fn from_proto(result: proto::StmtResult, int_mode: IntMode) -> Result<Self> {
        let cols = Arc::new(result.cols);
        let rows = result
            .rows
            .into_iter()
            .map(|row| Row::from_proto(cols.clone(), row, int_mode))
            .collect::<Result<Vec<_>>>()?;
        Ok(ResultSet {
            cols,
            rows,
            affected_row_count: result.affected_row_count,
            last_insert_rowid: result.last_insert_rowid,
        })
    }

    pub fn columns(&self) -> &[proto::Col] {
        &self.cols
    }

    /// Names of the result columns, in order. Unnamed columns yield `None`.
    pub fn column_names(&self) -> Vec<Option<&str>> {
        self.cols.iter().map(|col| col.name.as_deref()).collect()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub(crate) fn into_first_row(self) -> Option<Row> {
        self.rows.into_iter().next()
    }

    pub(crate) fn into_first_value(self) -> Option<Value> {
        self.rows
            .into_iter()
            .next()
            .and_then(|row| row.values.into_iter().next())
    }
}

/// A single row of a result. Values are addressed by position; column names
/// resolve to the first column with that name.
#[derive(Debug, Clone)]
pub struct Row {
    cols: Arc<Vec<proto::Col>>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn from_proto(
        cols: Arc<Vec<proto::Col>>,
        row: proto::Row,
        int_mode: IntMode,
    ) -> Result<Self> {
        let values = row
            .values
            .into_iter()
            .map(|value| from_proto(value, int_mode))
            .collect::<Result<Vec<_>>>()?;
        Ok(Row { cols, values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get_value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the first column named `name`, if any. When multiple
    /// columns share a name, the first occurrence wins.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.index_of(name).and_then(|index| self.values.get(index))
    }

    /// Index of the first column named `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.cols
            .iter()
            .position(|col| col.name.as_deref() == Some(name))
    }

    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.cols.get(index).and_then(|col| col.name.as_deref())
    }

    /// Typed getter; converts the value at `index` into `T`.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self
            .values
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Misuse(format!("row has no column with index {index}")))?;
        T::from_value(value)
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

use std::sync::Arc;

use crate::proto::proto;
use crate::sql::{ClientId, Sql, SqlInner};
use crate::value::{into_proto, Value};
use crate::{Error, Result};

/// A SQL statement with bound arguments.
///
/// The statement carries either inline SQL text or a reference to a SQL
/// text stored on the server, never both. Positional and named arguments
/// can be mixed; the server resolves named parameters by their `:`, `@` or
/// `$` sigil.
#[derive(Debug, Clone)]
pub struct Statement {
    sql: SqlText,
    args: Vec<Value>,
    named_args: Vec<(String, Value)>,
    want_rows: bool,
}

#[derive(Debug, Clone)]
enum SqlText {
    Text(String),
    Stored(Arc<SqlInner>),
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Statement {
            sql: SqlText::Text(sql.into()),
            args: Vec::new(),
            named_args: Vec::new(),
            want_rows: true,
        }
    }

    /// Statement referring to a SQL text previously stored with
    /// `store_sql`.
    pub fn from_stored(sql: &Sql) -> Self {
        Statement {
            sql: SqlText::Stored(sql.inner.clone()),
            args: Vec::new(),
            named_args: Vec::new(),
            want_rows: true,
        }
    }

    /// Appends a positional argument.
    pub fn bind(&mut self, value: impl Into<Value>) -> &mut Self {
        self.args.push(value.into());
        self
    }

    /// Binds a positional argument by its 1-based index, padding any
    /// preceding unbound positions with `NULL`.
    pub fn bind_index(&mut self, index: u32, value: impl Into<Value>) -> Result<()> {
        if index < 1 {
            return Err(Error::Misuse(
                "binding indexes start at 1, cannot bind index 0".into(),
            ));
        }
        let index = index as usize;
        if self.args.len() < index {
            self.args.resize(index, Value::Null);
        }
        self.args[index - 1] = value.into();
        Ok(())
    }

    /// Replaces all positional arguments.
    pub fn bind_all(&mut self, values: impl IntoIterator<Item = impl Into<Value>>) -> &mut Self {
        self.args = values.into_iter().map(Into::into).collect();
        self
    }

    /// Binds a named argument. The name may carry its sigil (`:name`,
    /// `@name`, `$name`); it is passed to the server as given.
    pub fn bind_named(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.named_args.push((name.into(), value.into()));
        self
    }

    /// Removes all bound arguments, positional and named.
    pub fn unbind_all(&mut self) -> &mut Self {
        self.args.clear();
        self.named_args.clear();
        self
    }

    /// Whether the server should send back the rows this statement
    /// produces. `query` and `run` on a stream override this per call.
    pub fn set_want_rows(&mut self, want_rows: bool) -> &mut Self {
        self.want_rows = want_rows;
        self
    }

    /// Converts into the wire form, validating the arguments and the stored
    /// SQL handle. Returns the handle so the HTTP transport can ship its
    /// text to streams that have not stored it yet.
    pub(crate) fn into_proto(
        self,
        client: &ClientId,
    ) -> Result<(proto::Stmt, Option<Arc<SqlInner>>)> {
        let (sql, sql_id, stored) = match self.sql {
            SqlText::Text(text) => (Some(text), None, None),
            SqlText::Stored(inner) => {
                inner.check_usable(client)?;
                (None, Some(inner.sql_id), Some(inner))
            }
        };
        let args = self
            .args
            .into_iter()
            .map(into_proto)
            .collect::<Result<Vec<_>>>()?;
        let named_args = self
            .named_args
            .into_iter()
            .map(|(name, value)| {
                Ok(proto::NamedArg {
                    name,
                    value: into_proto(value)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let stmt = proto::Stmt {
            sql,
            sql_id,
            args,
            named_args,
            want_rows: Some(self.want_rows),
        };
        Ok((stmt, stored))
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}

impl From<&Sql> for Statement {
    fn from(sql: &Sql) -> Self {
        Statement::from_stored(sql)
    }
}

/// Refers to a SQL text either inline or through a stored handle; used by
/// `describe` and `sequence`.
pub trait SqlDescriptor {
    fn sql_description(&self) -> SqlDescription;
}

#[derive(Debug, Clone)]
pub enum SqlDescription {
    Sql(String),
    Stored(Sql),
}

impl SqlDescriptor for str {
    fn sql_description(&self) -> SqlDescription {
        SqlDescription::Sql(self.to_string())
    }
}

impl SqlDescriptor for String {
    fn sql_description(&self) -> SqlDescription {
        SqlDescription::Sql(self.clone())
    }
}

impl SqlDescriptor for Sql {
    fn sql_description(&self) -> SqlDescription {
        SqlDescription::Stored(self.clone())
    }
}

impl<T: SqlDescriptor + ?Sized> SqlDescriptor for &T {
    fn sql_description(&self) -> SqlDescription {
        (**self).sql_description()
    }
}

impl SqlDescription {
    /// Splits into the wire pair (`sql`, `sql_id`), validating a stored
    /// handle against the using client.
    pub(crate) fn into_parts(
        self,
        client: &ClientId,
    ) -> Result<(Option<String>, Option<i32>, Option<Arc<SqlInner>>)> {
        match self {
            SqlDescription::Sql(sql) => Ok((Some(sql), None, None)),
            SqlDescription::Stored(sql) => {
                sql.inner.check_usable(client)?;
                let sql_id = sql.inner.sql_id;
                Ok((None, Some(sql_id), Some(sql.inner)))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sql::ClientId;

    #[test]
    fn bind_index_pads_with_null() {
        let mut stmt = Statement::new("SELECT ?1, ?3");
        stmt.bind_index(3, 30).unwrap();
        stmt.bind_index(1, 10).unwrap();
        let client = ClientId::new();
        let (stmt, _) = stmt.into_proto(&client).unwrap();
        assert_eq!(
            stmt.args,
            vec![
                proto::Value::Integer { value: 10 },
                proto::Value::Null,
                proto::Value::Integer { value: 30 },
            ]
        );
    }

    #[test]
    fn bind_index_zero_is_misuse() {
        let mut stmt = Statement::new("SELECT ?");
        assert!(matches!(stmt.bind_index(0, 1), Err(Error::Misuse(_))));
    }

    #[test]
    fn named_args_keep_sigils() {
        let mut stmt = Statement::new("SELECT :one, @two, $three");
        stmt.bind_named(":one", 10)
            .bind_named("two", 20)
            .bind_named("$three", 30);
        let client = ClientId::new();
        let (stmt, _) = stmt.into_proto(&client).unwrap();
        let names: Vec<_> = stmt.named_args.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec![":one", "two", "$three"]);
    }

    #[test]
    fn unbind_all_clears_everything() {
        let mut stmt = Statement::new("SELECT ?");
        stmt.bind(1).bind_named(":a", 2);
        stmt.unbind_all();
        let client = ClientId::new();
        let (stmt, _) = stmt.into_proto(&client).unwrap();
        assert!(stmt.args.is_empty());
        assert!(stmt.named_args.is_empty());
    }
}

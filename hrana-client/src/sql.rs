use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Identity of a client, used to detect handles that are used with a client
/// other than the one that created them.
#[derive(Clone, Debug)]
pub(crate) struct ClientId(Arc<()>);

impl ClientId {
    pub fn new() -> Self {
        ClientId(Arc::new(()))
    }

    pub fn matches(&self, other: &ClientId) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Handle to a SQL text cached on the server under an integer id.
///
/// Statements can refer to the handle instead of inlining the text, which
/// saves bandwidth for SQL that is executed repeatedly. The handle is owned
/// by the client that created it with `store_sql`; using it with another
/// client or after closing it is a misuse error.
#[derive(Clone, Debug)]
pub struct Sql {
    pub(crate) inner: Arc<SqlInner>,
}

#[derive(Debug)]
pub(crate) struct SqlInner {
    pub sql_id: i32,
    pub text: Arc<str>,
    pub owner: ClientId,
    pub closed: AtomicBool,
}

impl Sql {
    pub(crate) fn new(sql_id: i32, text: Arc<str>, owner: ClientId) -> Self {
        Sql {
            inner: Arc::new(SqlInner {
                sql_id,
                text,
                owner,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The server-side id of this SQL text.
    pub fn sql_id(&self) -> i32 {
        self.inner.sql_id
    }

    /// Marks the handle closed. Returns false when it already was; closing
    /// is idempotent. Fails when `client` is not the owner.
    pub(crate) fn begin_close(&self, client: &ClientId) -> Result<bool> {
        if !self.inner.owner.matches(client) {
            return Err(Error::Misuse(
                "SQL handle is used with a client that did not create it".into(),
            ));
        }
        Ok(!self.inner.closed.swap(true, Ordering::SeqCst))
    }
}

impl SqlInner {
    pub fn check_usable(&self, client: &ClientId) -> Result<()> {
        if !self.owner.matches(client) {
            return Err(Error::Misuse(
                "SQL handle is used with a client that did not create it".into(),
            ));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Misuse("SQL handle is closed".into()));
        }
        Ok(())
    }
}

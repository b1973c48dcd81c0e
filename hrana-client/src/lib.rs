//! A client for the Hrana protocol, which exposes interactive SQL streams of
//! a SQLite-family server over a single bidirectional transport.
//!
//! Two transports are supported: a persistent WebSocket ([`ws`]) and a
//! pipelined HTTP connection chained by batons ([`http`]). Both negotiate a
//! protocol version and an encoding (JSON or a compact protobuf-compatible
//! binary format) and then speak the same data model: statements, batches
//! with conditional steps, describe/sequence operations and streaming
//! cursors.
//!
//! ```no_run
//! # async fn run() -> hrana_client::Result<()> {
//! let client = hrana_client::ws::connect("ws://localhost:8080", None).await?;
//! let stream = client.open_stream()?;
//! let rows = stream.query("SELECT 1 AS one").await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;

pub mod batch;
pub mod cursor;
pub mod http;
pub mod statement;
pub mod ws;

mod errors;
mod id_alloc;
mod result;
mod sql;
mod util;
mod value;

pub use hrana_client_proto as proto;

pub use batch::{Batch, BatchCond, BatchResults};
pub use cursor::{Cursor, CursorEntry, RawCursor};
pub use errors::{Error, ProtocolError, ResponseError, Result};
pub use proto::proto::{Col, DescribeCol, DescribeParam, DescribeResult};
pub use result::{ResultSet, Row};
pub use sql::Sql;
pub use statement::{SqlDescription, SqlDescriptor, Statement};
pub use value::{FromValue, IntMode, Value};

/// Version of the Hrana protocol negotiated with the server.
///
/// Versions are ordered; features introduced in a later version fail with
/// [`Error::VersionNotSupported`] when the negotiated version is lower.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq)]
pub enum Version {
    Hrana1,
    Hrana2,
    Hrana3,
}

impl Version {
    pub(crate) fn check(self, min_version: Version, feature: &'static str) -> Result<()> {
        if self >= min_version {
            Ok(())
        } else {
            Err(Error::VersionNotSupported {
                feature,
                min_version,
                version: self,
            })
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Version::Hrana1 => write!(f, "hrana1"),
            Version::Hrana2 => write!(f, "hrana2"),
            Version::Hrana3 => write!(f, "hrana3"),
        }
    }
}

/// The encoding of messages that has been negotiated with the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Protobuf,
}

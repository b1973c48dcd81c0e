//! Structures for Hrana-over-HTTP: pipelined stream requests chained by a
//! baton, and cursor request/response bodies.

use serde::{Deserialize, Serialize};

use super::proto::{Batch, BatchResult, DescribeResult, Error, Stmt, StmtResult};

#[derive(Serialize, prost::Message)]
pub struct PipelineReqBody {
    #[prost(string, optional, tag = "1")]
    pub baton: Option<String>,
    #[prost(message, repeated, tag = "2")]
    pub requests: Vec<StreamRequest>,
}

#[derive(Deserialize, prost::Message)]
pub struct PipelineRespBody {
    #[prost(string, optional, tag = "1")]
    pub baton: Option<String>,
    #[serde(default)]
    #[prost(string, optional, tag = "2")]
    pub base_url: Option<String>,
    #[serde(default)]
    #[prost(message, repeated, tag = "3")]
    pub results: Vec<StreamResult>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamResult {
    #[serde(skip)]
    #[default]
    None,
    Ok {
        response: StreamResponse,
    },
    Error {
        error: Error,
    },
}

#[derive(Serialize, prost::Message)]
pub struct CursorReqBody {
    #[prost(string, optional, tag = "1")]
    pub baton: Option<String>,
    #[prost(message, required, tag = "2")]
    pub batch: Batch,
}

#[derive(Deserialize, prost::Message)]
pub struct CursorRespBody {
    #[prost(string, optional, tag = "1")]
    pub baton: Option<String>,
    #[serde(default)]
    #[prost(string, optional, tag = "2")]
    pub base_url: Option<String>,
}

#[derive(Serialize, Debug, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRequest {
    #[serde(skip)]
    #[default]
    None,
    Close(CloseStreamReq),
    Execute(ExecuteStreamReq),
    Batch(BatchStreamReq),
    Sequence(SequenceStreamReq),
    Describe(DescribeStreamReq),
    StoreSql(StoreSqlStreamReq),
    CloseSql(CloseSqlStreamReq),
    GetAutocommit(GetAutocommitStreamReq),
}

impl StreamRequest {
    /// Name of the request type, matching its JSON `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamRequest::None => "none",
            StreamRequest::Close(_) => "close",
            StreamRequest::Execute(_) => "execute",
            StreamRequest::Batch(_) => "batch",
            StreamRequest::Sequence(_) => "sequence",
            StreamRequest::Describe(_) => "describe",
            StreamRequest::StoreSql(_) => "store_sql",
            StreamRequest::CloseSql(_) => "close_sql",
            StreamRequest::GetAutocommit(_) => "get_autocommit",
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamResponse {
    #[serde(skip)]
    #[default]
    None,
    Close(CloseStreamResp),
    Execute(ExecuteStreamResp),
    Batch(BatchStreamResp),
    Sequence(SequenceStreamResp),
    Describe(DescribeStreamResp),
    StoreSql(StoreSqlStreamResp),
    CloseSql(CloseSqlStreamResp),
    GetAutocommit(GetAutocommitStreamResp),
}

impl StreamResponse {
    /// Name of the response type, matching its JSON `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamResponse::None => "none",
            StreamResponse::Close(_) => "close",
            StreamResponse::Execute(_) => "execute",
            StreamResponse::Batch(_) => "batch",
            StreamResponse::Sequence(_) => "sequence",
            StreamResponse::Describe(_) => "describe",
            StreamResponse::StoreSql(_) => "store_sql",
            StreamResponse::CloseSql(_) => "close_sql",
            StreamResponse::GetAutocommit(_) => "get_autocommit",
        }
    }
}

#[derive(Serialize, prost::Message)]
pub struct CloseStreamReq {}

#[derive(Deserialize, prost::Message)]
pub struct CloseStreamResp {}

#[derive(Serialize, prost::Message)]
pub struct ExecuteStreamReq {
    #[prost(message, required, tag = "1")]
    pub stmt: Stmt,
}

#[derive(Deserialize, prost::Message)]
pub struct ExecuteStreamResp {
    #[prost(message, required, tag = "1")]
    pub result: StmtResult,
}

#[derive(Serialize, prost::Message)]
pub struct BatchStreamReq {
    #[prost(message, required, tag = "1")]
    pub batch: Batch,
}

#[derive(Deserialize, prost::Message)]
pub struct BatchStreamResp {
    #[prost(message, required, tag = "1")]
    pub result: BatchResult,
}

#[derive(Serialize, prost::Message)]
pub struct SequenceStreamReq {
    #[prost(string, optional, tag = "1")]
    pub sql: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub sql_id: Option<i32>,
}

#[derive(Deserialize, prost::Message)]
pub struct SequenceStreamResp {}

#[derive(Serialize, prost::Message)]
pub struct DescribeStreamReq {
    #[prost(string, optional, tag = "1")]
    pub sql: Option<String>,
    #[prost(int32, optional, tag = "2")]
    pub sql_id: Option<i32>,
}

#[derive(Deserialize, prost::Message)]
pub struct DescribeStreamResp {
    #[prost(message, required, tag = "1")]
    pub result: DescribeResult,
}

#[derive(Serialize, prost::Message)]
pub struct StoreSqlStreamReq {
    #[prost(int32, tag = "1")]
    pub sql_id: i32,
    #[prost(string, tag = "2")]
    pub sql: String,
}

#[derive(Deserialize, prost::Message)]
pub struct StoreSqlStreamResp {}

#[derive(Serialize, prost::Message)]
pub struct CloseSqlStreamReq {
    #[prost(int32, tag = "1")]
    pub sql_id: i32,
}

#[derive(Deserialize, prost::Message)]
pub struct CloseSqlStreamResp {}

#[derive(Serialize, prost::Message)]
pub struct GetAutocommitStreamReq {}

#[derive(Deserialize, prost::Message)]
pub struct GetAutocommitStreamResp {
    #[prost(bool, tag = "1")]
    pub is_autocommit: bool,
}

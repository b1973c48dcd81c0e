//! Structures for Hrana-over-WebSockets, client side: messages the client
//! sends serialize, messages the server sends deserialize.

use serde::{Deserialize, Serialize};

use super::proto::{Batch, BatchResult, CursorEntry, DescribeResult, Error, Stmt, StmtResult};

#[derive(Serialize, Debug, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    #[serde(skip)]
    #[default]
    None,
    Hello(HelloMsg),
    Request(RequestMsg),
}

#[derive(Serialize, prost::Message)]
pub struct HelloMsg {
    #[prost(string, optional, tag = "1")]
    pub jwt: Option<String>,
}

#[derive(Serialize, prost::Message)]
pub struct RequestMsg {
    #[prost(int32, tag = "1")]
    pub request_id: i32,
    #[prost(message, required, tag = "2")]
    pub request: Request,
}

#[derive(Deserialize, Debug, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    #[serde(skip)]
    #[default]
    None,
    HelloOk(HelloOkMsg),
    HelloError(HelloErrorMsg),
    ResponseOk(ResponseOkMsg),
    ResponseError(ResponseErrorMsg),
}

#[derive(Deserialize, prost::Message)]
pub struct HelloOkMsg {}

#[derive(Deserialize, prost::Message)]
pub struct HelloErrorMsg {
    #[prost(message, required, tag = "1")]
    pub error: Error,
}

#[derive(Deserialize, prost::Message)]
pub struct ResponseOkMsg {
    #[prost(int32, tag = "1")]
    pub request_id: i32,
    #[prost(message, required, tag = "2")]
    pub response: Response,
}

#[derive(Deserialize, prost::Message)]
pub struct ResponseErrorMsg {
    #[prost(int32, tag = "1")]
    pub request_id: i32,
    #[prost(message, required, tag = "2")]
    pub error: Error,
}

#[derive(Serialize, Debug, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    #[serde(skip)]
    #[default]
    None,
    OpenStream(OpenStreamReq),
    CloseStream(CloseStreamReq),
    Execute(ExecuteReq),
    Batch(BatchReq),
    OpenCursor(OpenCursorReq),
    CloseCursor(CloseCursorReq),
    FetchCursor(FetchCursorReq),
    Sequence(SequenceReq),
    Describe(DescribeReq),
    StoreSql(StoreSqlReq),
    CloseSql(CloseSqlReq),
    GetAutocommit(GetAutocommitReq),
}

impl Request {
    /// Name of the request type, matching its JSON `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::None => "none",
            Request::OpenStream(_) => "open_stream",
            Request::CloseStream(_) => "close_stream",
            Request::Execute(_) => "execute",
            Request::Batch(_) => "batch",
            Request::OpenCursor(_) => "open_cursor",
            Request::CloseCursor(_) => "close_cursor",
            Request::FetchCursor(_) => "fetch_cursor",
            Request::Sequence(_) => "sequence",
            Request::Describe(_) => "describe",
            Request::StoreSql(_) => "store_sql",
            Request::CloseSql(_) => "close_sql",
            Request::GetAutocommit(_) => "get_autocommit",
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    #[serde(skip)]
    #[default]
    None,
    OpenStream(OpenStreamResp),
    CloseStream(CloseStreamResp),
    Execute(ExecuteResp),
    Batch(BatchResp),
    OpenCursor(OpenCursorResp),
    CloseCursor(CloseCursorResp),
    FetchCursor(FetchCursorResp),
    Sequence(SequenceResp),
    Describe(DescribeResp),
    StoreSql(StoreSqlResp),
    CloseSql(CloseSqlResp),
    GetAutocommit(GetAutocommitResp),
}

impl Response {
    /// Name of the response type, matching its JSON `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Response::None => "none",
            Response::OpenStream(_) => "open_stream",
            Response::CloseStream(_) => "close_stream",
            Response::Execute(_) => "execute",
            Response::Batch(_) => "batch",
            Response::OpenCursor(_) => "open_cursor",
            Response::CloseCursor(_) => "close_cursor",
            Response::FetchCursor(_) => "fetch_cursor",
            Response::Sequence(_) => "sequence",
            Response::Describe(_) => "describe",
            Response::StoreSql(_) => "store_sql",
            Response::CloseSql(_) => "close_sql",
            Response::GetAutocommit(_) => "get_autocommit",
        }
    }
}

#[derive(Serialize, prost::Message)]
pub struct OpenStreamReq {
    #[prost(int32, tag = "1")]
    pub stream_id: i32,
}

#[derive(Deserialize, prost::Message)]
pub struct OpenStreamResp {}

#[derive(Serialize, prost::Message)]
pub struct CloseStreamReq {
    #[prost(int32, tag = "1")]
    pub stream_id: i32,
}

#[derive(Deserialize, prost::Message)]
pub struct CloseStreamResp {}

#[derive(Serialize, prost::Message)]
pub struct ExecuteReq {
    #[prost(int32, tag = "1")]
    pub stream_id: i32,
    #[prost(message, required, tag = "2")]
    pub stmt: Stmt,
}

#[derive(Deserialize, prost::Message)]
pub struct ExecuteResp {
    #[prost(message, required, tag = "1")]
    pub result: StmtResult,
}

#[derive(Serialize, prost::Message)]
pub struct BatchReq {
    #[prost(int32, tag = "1")]
    pub stream_id: i32,
    #[prost(message, required, tag = "2")]
    pub batch: Batch,
}

#[derive(Deserialize, prost::Message)]
pub struct BatchResp {
    #[prost(message, required, tag = "1")]
    pub result: BatchResult,
}

#[derive(Serialize, prost::Message)]
pub struct OpenCursorReq {
    #[prost(int32, tag = "1")]
    pub stream_id: i32,
    #[prost(int32, tag = "2")]
    pub cursor_id: i32,
    #[prost(message, required, tag = "3")]
    pub batch: Batch,
}

#[derive(Deserialize, prost::Message)]
pub struct OpenCursorResp {}

#[derive(Serialize, prost::Message)]
pub struct CloseCursorReq {
    #[prost(int32, tag = "1")]
    pub cursor_id: i32,
}

#[derive(Deserialize, prost::Message)]
pub struct CloseCursorResp {}

#[derive(Serialize, prost::Message)]
pub struct FetchCursorReq {
    #[prost(int32, tag = "1")]
    pub cursor_id: i32,
    #[prost(uint32, tag = "2")]
    pub max_count: u32,
}

#[derive(Deserialize, prost::Message)]
pub struct FetchCursorResp {
    #[serde(default)]
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<CursorEntry>,
    #[prost(bool, tag = "2")]
    pub done: bool,
}

#[derive(Serialize, prost::Message)]
pub struct SequenceReq {
    #[prost(int32, tag = "1")]
    pub stream_id: i32,
    #[prost(string, optional, tag = "2")]
    pub sql: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub sql_id: Option<i32>,
}

#[derive(Deserialize, prost::Message)]
pub struct SequenceResp {}

#[derive(Serialize, prost::Message)]
pub struct DescribeReq {
    #[prost(int32, tag = "1")]
    pub stream_id: i32,
    #[prost(string, optional, tag = "2")]
    pub sql: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub sql_id: Option<i32>,
}

#[derive(Deserialize, prost::Message)]
pub struct DescribeResp {
    #[prost(message, required, tag = "1")]
    pub result: DescribeResult,
}

#[derive(Serialize, prost::Message)]
pub struct StoreSqlReq {
    #[prost(int32, tag = "1")]
    pub sql_id: i32,
    #[prost(string, tag = "2")]
    pub sql: String,
}

#[derive(Deserialize, prost::Message)]
pub struct StoreSqlResp {}

#[derive(Serialize, prost::Message)]
pub struct CloseSqlReq {
    #[prost(int32, tag = "1")]
    pub sql_id: i32,
}

#[derive(Deserialize, prost::Message)]
pub struct CloseSqlResp {}

#[derive(Serialize, prost::Message)]
pub struct GetAutocommitReq {
    #[prost(int32, tag = "1")]
    pub stream_id: i32,
}

#[derive(Deserialize, prost::Message)]
pub struct GetAutocommitResp {
    #[prost(bool, tag = "1")]
    pub is_autocommit: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_msg_json_shapes() {
        let msg = ClientMsg::Hello(HelloMsg {
            jwt: Some("token".into()),
        });
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"hello","jwt":"token"}"#
        );

        let msg = ClientMsg::Request(RequestMsg {
            request_id: 7,
            request: Request::OpenStream(OpenStreamReq { stream_id: 1 }),
        });
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"request","request_id":7,"request":{"type":"open_stream","stream_id":1}}"#
        );
    }

    #[test]
    fn server_msg_json_shapes() {
        let msg: ServerMsg = serde_json::from_str(r#"{"type": "hello_ok"}"#).unwrap();
        assert!(matches!(msg, ServerMsg::HelloOk(_)));

        let msg: ServerMsg = serde_json::from_str(
            r#"{"type": "response_error", "request_id": 3,
                "error": {"message": "no such table", "code": "SQLITE_ERROR"}}"#,
        )
        .unwrap();
        match msg {
            ServerMsg::ResponseError(msg) => {
                assert_eq!(msg.request_id, 3);
                assert_eq!(msg.error.code.as_deref(), Some("SQLITE_ERROR"));
            }
            other => panic!("unexpected msg: {other:?}"),
        }

        let msg: ServerMsg = serde_json::from_str(
            r#"{"type": "response_ok", "request_id": 1,
                "response": {"type": "get_autocommit", "is_autocommit": true}}"#,
        )
        .unwrap();
        match msg {
            ServerMsg::ResponseOk(msg) => match msg.response {
                Response::GetAutocommit(resp) => assert!(resp.is_autocommit),
                other => panic!("unexpected response: {other:?}"),
            },
            other => panic!("unexpected msg: {other:?}"),
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::id_alloc::IdAlloc;
use crate::proto::ws::{ClientMsg, HelloMsg, Request, RequestMsg, Response, ServerMsg};
use crate::{Encoding, Error, ProtocolError, Result};

pub(super) type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) enum Op {
    Request {
        request: Request,
        done: oneshot::Sender<Result<Response>>,
    },
    Close,
}

struct Conn {
    /// Requests that were sent but not yet answered, keyed by request id.
    pending: HashMap<i32, PendingRequest>,
    request_ids: IdAlloc,
    /// Set once the server confirmed our `hello`.
    hello_done: bool,
}

struct PendingRequest {
    /// Type of the request, which the response type must match.
    expected: &'static str,
    done: oneshot::Sender<Result<Response>>,
}

/// Owns the socket: sends the `hello`, ships requests with freshly
/// allocated ids, and dispatches responses back to their oneshot senders.
/// The first fatal error (or a manual close) tears everything down; every
/// pending request then fails with a closed error carrying the cause.
pub(super) async fn run(
    mut ws: WsConn,
    encoding: Encoding,
    jwt: Option<String>,
    mut op_rx: mpsc::UnboundedReceiver<Op>,
    close_cause: Arc<OnceLock<Arc<Error>>>,
) {
    let mut conn = Conn {
        pending: HashMap::new(),
        request_ids: IdAlloc::new(),
        hello_done: false,
    };

    let result = drive(&mut ws, encoding, jwt, &mut op_rx, &mut conn).await;
    let cause = Arc::new(result.err().unwrap_or(Error::ClientClosed));
    let _ = close_cause.set(cause.clone());
    tracing::debug!("hrana websocket connection closed: {}", cause);

    for (_, request) in conn.pending.drain() {
        let _ = request.done.send(Err(Error::closed(cause.clone())));
    }

    // Reject everything that was enqueued but never made it to the wire.
    op_rx.close();
    while let Ok(op) = op_rx.try_recv() {
        if let Op::Request { done, .. } = op {
            let _ = done.send(Err(Error::closed(cause.clone())));
        }
    }

    let _ = ws.close(None).await;
}

async fn drive(
    ws: &mut WsConn,
    encoding: Encoding,
    jwt: Option<String>,
    op_rx: &mut mpsc::UnboundedReceiver<Op>,
    conn: &mut Conn,
) -> Result<()> {
    send_msg(ws, encoding, &ClientMsg::Hello(HelloMsg { jwt })).await?;

    loop {
        tokio::select! {
            op = op_rx.recv() => match op {
                // All client handles were dropped.
                None => return Ok(()),
                Some(Op::Close) => return Err(Error::ClientClosed),
                Some(Op::Request { request, done }) => {
                    let request_id = conn.request_ids.alloc();
                    let expected = request.type_name();
                    let msg = ClientMsg::Request(RequestMsg { request_id, request });
                    send_msg(ws, encoding, &msg).await?;
                    conn.pending.insert(request_id, PendingRequest { expected, done });
                }
            },
            msg = ws.next() => match msg {
                None => return Err(Error::WebSocket("connection closed by the server".into())),
                Some(Err(err)) => return Err(Error::WebSocket(err.to_string())),
                Some(Ok(msg)) => {
                    if let Some(server_msg) = recv_msg(ws, encoding, msg).await? {
                        handle_server_msg(conn, server_msg)?;
                    }
                }
            },
        }
    }
}

async fn send_msg(ws: &mut WsConn, encoding: Encoding, msg: &ClientMsg) -> Result<()> {
    let msg = match encoding {
        Encoding::Json => {
            let text = serde_json::to_string(msg)
                .map_err(|err| Error::Internal(format!("could not serialize message: {err}")))?;
            Message::Text(text)
        }
        Encoding::Protobuf => Message::Binary(<ClientMsg as prost::Message>::encode_to_vec(msg)),
    };
    ws.send(msg)
        .await
        .map_err(|err| Error::WebSocket(err.to_string()))
}

async fn recv_msg(
    ws: &mut WsConn,
    encoding: Encoding,
    msg: Message,
) -> Result<Option<ServerMsg>> {
    match msg {
        Message::Text(text) => {
            if encoding != Encoding::Json {
                return Err(ProtocolError::TextWebSocketMessage.into());
            }
            let msg = serde_json::from_str(&text)
                .map_err(|source| ProtocolError::JsonDeserialize { source })?;
            Ok(Some(msg))
        }
        Message::Binary(data) => {
            if encoding != Encoding::Protobuf {
                return Err(ProtocolError::BinaryWebSocketMessage.into());
            }
            let msg = <ServerMsg as prost::Message>::decode(data.as_slice())
                .map_err(|source| ProtocolError::ProtobufDecode { source })?;
            Ok(Some(msg))
        }
        Message::Ping(data) => {
            ws.send(Message::Pong(data))
                .await
                .map_err(|err| Error::WebSocket(err.to_string()))?;
            Ok(None)
        }
        Message::Pong(_) => Ok(None),
        Message::Close(_) => Err(Error::WebSocket("connection closed by the server".into())),
        Message::Frame(_) => panic!("received a tungstenite::Message::Frame"),
    }
}

fn handle_server_msg(conn: &mut Conn, msg: ServerMsg) -> Result<()> {
    match msg {
        ServerMsg::None => Err(ProtocolError::NoneServerMsg.into()),
        ServerMsg::HelloOk(_) => {
            if conn.hello_done {
                Err(ProtocolError::DuplicateHello.into())
            } else {
                conn.hello_done = true;
                Ok(())
            }
        }
        ServerMsg::HelloError(msg) => {
            if conn.hello_done {
                Err(ProtocolError::DuplicateHello.into())
            } else {
                Err(Error::Response(msg.error.into()))
            }
        }
        ServerMsg::ResponseOk(msg) => {
            if !conn.hello_done {
                return Err(ProtocolError::ResponseBeforeHello.into());
            }
            let Some(request) = conn.pending.remove(&msg.request_id) else {
                return Err(ProtocolError::UnexpectedRequestId {
                    request_id: msg.request_id,
                }
                .into());
            };
            conn.request_ids.free(msg.request_id);
            if matches!(msg.response, Response::None) {
                let _ = request.done.send(Err(ProtocolError::NoneResponse.into()));
                return Err(ProtocolError::NoneResponse.into());
            }
            let got = msg.response.type_name();
            if got != request.expected {
                let expected = request.expected;
                let _ = request
                    .done
                    .send(Err(ProtocolError::ResponseMismatch { expected, got }.into()));
                return Err(ProtocolError::ResponseMismatch { expected, got }.into());
            }
            let _ = request.done.send(Ok(msg.response));
            Ok(())
        }
        ServerMsg::ResponseError(msg) => {
            if !conn.hello_done {
                return Err(ProtocolError::ResponseBeforeHello.into());
            }
            match conn.pending.remove(&msg.request_id) {
                Some(request) => {
                    conn.request_ids.free(msg.request_id);
                    let _ = request.done.send(Err(Error::Response(msg.error.into())));
                    Ok(())
                }
                None => Err(ProtocolError::UnexpectedRequestId {
                    request_id: msg.request_id,
                }
                .into()),
            }
        }
    }
}

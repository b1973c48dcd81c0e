use bytes::{Buf as _, Bytes, BytesMut};
use futures::StreamExt as _;
use tokio_util::codec::Decoder;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use super::stream::RawStream;
use super::{expect_ok, HttpSend};
use crate::cursor::RawCursor;
use crate::proto::http::{CursorReqBody, CursorRespBody};
use crate::proto::proto;
use crate::{Encoding, Error, ProtocolError, Result};

/// Opens a cursor by POSTing the batch and parsing the head of the
/// streaming response body. The stream's serialization guard moves into
/// the returned source, so the stream stays blocked until the cursor is
/// dropped or closed.
pub(super) async fn open_cursor<T: HttpSend>(
    mut guard: OwnedMutexGuard<RawStream<T>>,
    batch: proto::Batch,
) -> Result<CursorSource<T>> {
    if guard.server_closed {
        return Err(Error::stream_closed());
    }
    let Some(cursor_url) = guard.cursor_url.clone() else {
        return Err(Error::Internal(
            "cursor endpoint is missing for a v3 connection".into(),
        ));
    };
    let body = CursorReqBody {
        baton: guard.baton.clone(),
        batch,
    };
    let bytes = match guard.encoding {
        Encoding::Json => Bytes::from(
            serde_json::to_vec(&body)
                .map_err(|err| Error::Internal(format!("could not serialize request: {err}")))?,
        ),
        Encoding::Protobuf => Bytes::from(<CursorReqBody as prost::Message>::encode_to_vec(&body)),
    };
    let response = guard
        .sender
        .http_send(
            http::Method::POST,
            cursor_url,
            guard.auth.clone(),
            bytes,
            guard.endpoint.content_type(),
        )
        .await?;
    let body = expect_ok(response).await?;

    let mut frames = CursorFrames::new(body, guard.encoding);
    let Some(first) = frames.next_frame().await? else {
        return Err(ProtocolError::TruncatedCursorBody.into());
    };
    let head: CursorRespBody = decode_frame(&first, guard.encoding)?;
    if let Some(base_url) = head.base_url {
        guard.update_base_url(&base_url);
    }
    match head.baton {
        Some(baton) => guard.baton = Some(baton),
        None => {
            tracing::trace!("server closed the stream");
            guard.baton = None;
            guard.server_closed = true;
        }
    }
    Ok(CursorSource {
        frames,
        closed: false,
        guard: Some(guard),
    })
}

/// Entries of an HTTP cursor, parsed incrementally out of the response
/// body.
pub struct CursorSource<T: HttpSend> {
    frames: CursorFrames<T::Stream>,
    closed: bool,
    guard: Option<OwnedMutexGuard<RawStream<T>>>,
}

#[async_trait]
impl<T: HttpSend> RawCursor for CursorSource<T> {
    async fn next_entry(&mut self) -> Result<Option<proto::CursorEntry>> {
        if self.closed {
            return Ok(None);
        }
        let encoding = self.frames.encoding();
        match self.frames.next_frame().await? {
            None => Ok(None),
            Some(frame) => Ok(Some(decode_frame(&frame, encoding)?)),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Dropping the body aborts the transfer; dropping the guard lets
        // the stream's other requests proceed.
        self.guard = None;
    }
}

fn decode_frame<M>(frame: &Bytes, encoding: Encoding) -> Result<M>
where
    M: serde::de::DeserializeOwned + prost::Message + Default,
{
    match encoding {
        Encoding::Json => {
            serde_json::from_slice(frame).map_err(|source| ProtocolError::JsonDeserialize { source }.into())
        }
        Encoding::Protobuf => {
            M::decode(frame.as_ref()).map_err(|source| ProtocolError::ProtobufDecode { source }.into())
        }
    }
}

/// Splits a streaming response body into message frames: newline-delimited
/// for JSON, varint-length-prefixed for protobuf.
pub(super) struct CursorFrames<S> {
    body: S,
    buf: BytesMut,
    codec: FrameCodec,
    eof: bool,
}

impl<S> CursorFrames<S>
where
    S: futures::Stream<Item = Result<Bytes>> + Unpin,
{
    pub fn new(body: S, encoding: Encoding) -> Self {
        CursorFrames {
            body,
            buf: BytesMut::new(),
            codec: FrameCodec { encoding },
            eof: false,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.codec.encoding
    }

    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                if frame.is_empty() {
                    continue;
                }
                return Ok(Some(frame));
            }
            if self.eof {
                return match self.codec.decode_eof(&mut self.buf)? {
                    Some(frame) if !frame.is_empty() => Ok(Some(frame)),
                    _ => Ok(None),
                };
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    self.eof = true;
                    return Err(err);
                }
                None => self.eof = true,
            }
        }
    }
}

struct FrameCodec {
    encoding: Encoding,
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.encoding {
            Encoding::Json => match src.iter().position(|byte| *byte == b'\n') {
                None => Ok(None),
                Some(pos) => {
                    let line = src.split_to(pos + 1);
                    Ok(Some(line.freeze().slice(..pos)))
                }
            },
            Encoding::Protobuf => {
                let mut length = 0u64;
                for (index, byte) in src.iter().enumerate() {
                    if index >= 10 {
                        return Err(ProtocolError::ProtobufDecode {
                            source: prost::DecodeError::new("length prefix varint is too long"),
                        }
                        .into());
                    }
                    length |= ((byte & 0x7f) as u64) << (7 * index);
                    if byte & 0x80 == 0 {
                        let header = index + 1;
                        let length = length as usize;
                        if src.len() < header + length {
                            return Ok(None);
                        }
                        src.advance(header);
                        return Ok(Some(src.split_to(length).freeze()));
                    }
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.encoding {
            // A final JSON message may lack its trailing newline.
            Encoding::Json => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    let line = src.split_to(src.len());
                    Ok(Some(line.freeze()))
                }
            }
            Encoding::Protobuf => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    Err(ProtocolError::TruncatedCursorBody.into())
                }
            }
        }
    }
}

use std::mem::replace;
use std::sync::Arc;

use ::bytes::{Buf, BufMut, Bytes};
use prost::encoding::{
    bytes, double, encode_key, encode_varint, encoded_len_varint, key_len, message, sint64,
    skip_field, string, uint32, DecodeContext, WireType,
};
use prost::DecodeError;

use crate::http::{StreamRequest, StreamResponse, StreamResult};
use crate::proto::{BatchCond, BatchResult, CursorEntry, Value};
use crate::ws::{ClientMsg, Request, Response, ServerMsg};

impl prost::Message for ClientMsg {
    fn encode_raw<B>(&self, buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        match self {
            ClientMsg::None => {}
            ClientMsg::Hello(msg) => message::encode(1, msg, buf),
            ClientMsg::Request(msg) => message::encode(2, msg, buf),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            ClientMsg::None => 0,
            ClientMsg::Hello(msg) => message::encoded_len(1, msg),
            ClientMsg::Request(msg) => message::encoded_len(2, msg),
        }
    }

    fn merge_field<B>(
        &mut self,
        _tag: u32,
        _wire_type: WireType,
        _buf: &mut B,
        _ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        panic!("ClientMsg can only be encoded, not decoded")
    }

    fn clear(&mut self) {
        panic!("ClientMsg can only be encoded, not decoded")
    }
}

impl prost::Message for Request {
    fn encode_raw<B>(&self, buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        match self {
            Request::None => {}
            Request::OpenStream(msg) => message::encode(1, msg, buf),
            Request::CloseStream(msg) => message::encode(2, msg, buf),
            Request::Execute(msg) => message::encode(3, msg, buf),
            Request::Batch(msg) => message::encode(4, msg, buf),
            Request::OpenCursor(msg) => message::encode(5, msg, buf),
            Request::CloseCursor(msg) => message::encode(6, msg, buf),
            Request::FetchCursor(msg) => message::encode(7, msg, buf),
            Request::Sequence(msg) => message::encode(8, msg, buf),
            Request::Describe(msg) => message::encode(9, msg, buf),
            Request::StoreSql(msg) => message::encode(10, msg, buf),
            Request::CloseSql(msg) => message::encode(11, msg, buf),
            Request::GetAutocommit(msg) => message::encode(12, msg, buf),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Request::None => 0,
            Request::OpenStream(msg) => message::encoded_len(1, msg),
            Request::CloseStream(msg) => message::encoded_len(2, msg),
            Request::Execute(msg) => message::encoded_len(3, msg),
            Request::Batch(msg) => message::encoded_len(4, msg),
            Request::OpenCursor(msg) => message::encoded_len(5, msg),
            Request::CloseCursor(msg) => message::encoded_len(6, msg),
            Request::FetchCursor(msg) => message::encoded_len(7, msg),
            Request::Sequence(msg) => message::encoded_len(8, msg),
            Request::Describe(msg) => message::encoded_len(9, msg),
            Request::StoreSql(msg) => message::encoded_len(10, msg),
            Request::CloseSql(msg) => message::encoded_len(11, msg),
            Request::GetAutocommit(msg) => message::encoded_len(12, msg),
        }
    }

    fn merge_field<B>(
        &mut self,
        _tag: u32,
        _wire_type: WireType,
        _buf: &mut B,
        _ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        panic!("Request can only be encoded, not decoded")
    }

    fn clear(&mut self) {
        panic!("Request can only be encoded, not decoded")
    }
}

impl prost::Message for ServerMsg {
    fn encode_raw<B>(&self, _buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        panic!("ServerMsg can only be decoded, not encoded")
    }

    fn encoded_len(&self) -> usize {
        panic!("ServerMsg can only be decoded, not encoded")
    }

    fn merge_field<B>(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut B,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        macro_rules! merge {
            ($variant:ident) => {{
                let mut msg = match replace(self, ServerMsg::None) {
                    ServerMsg::$variant(msg) => msg,
                    _ => Default::default(),
                };
                message::merge(wire_type, &mut msg, buf, ctx)?;
                *self = ServerMsg::$variant(msg);
            }};
        }

        match tag {
            1 => merge!(HelloOk),
            2 => merge!(HelloError),
            3 => merge!(ResponseOk),
            4 => merge!(ResponseError),
            _ => skip_field(wire_type, tag, buf, ctx)?,
        }
        Ok(())
    }

    fn clear(&mut self) {
        *self = ServerMsg::None;
    }
}

impl prost::Message for Response {
    fn encode_raw<B>(&self, _buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        panic!("Response can only be decoded, not encoded")
    }

    fn encoded_len(&self) -> usize {
        panic!("Response can only be decoded, not encoded")
    }

    fn merge_field<B>(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut B,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        macro_rules! merge {
            ($variant:ident) => {{
                let mut msg = match replace(self, Response::None) {
                    Response::$variant(msg) => msg,
                    _ => Default::default(),
                };
                message::merge(wire_type, &mut msg, buf, ctx)?;
                *self = Response::$variant(msg);
            }};
        }

        match tag {
            1 => merge!(OpenStream),
            2 => merge!(CloseStream),
            3 => merge!(Execute),
            4 => merge!(Batch),
            5 => merge!(OpenCursor),
            6 => merge!(CloseCursor),
            7 => merge!(FetchCursor),
            8 => merge!(Sequence),
            9 => merge!(Describe),
            10 => merge!(StoreSql),
            11 => merge!(CloseSql),
            12 => merge!(GetAutocommit),
            _ => skip_field(wire_type, tag, buf, ctx)?,
        }
        Ok(())
    }

    fn clear(&mut self) {
        *self = Response::None;
    }
}

impl prost::Message for StreamRequest {
    fn encode_raw<B>(&self, buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        match self {
            StreamRequest::None => {}
            StreamRequest::Close(msg) => message::encode(1, msg, buf),
            StreamRequest::Execute(msg) => message::encode(2, msg, buf),
            StreamRequest::Batch(msg) => message::encode(3, msg, buf),
            StreamRequest::Sequence(msg) => message::encode(4, msg, buf),
            StreamRequest::Describe(msg) => message::encode(5, msg, buf),
            StreamRequest::StoreSql(msg) => message::encode(6, msg, buf),
            StreamRequest::CloseSql(msg) => message::encode(7, msg, buf),
            StreamRequest::GetAutocommit(msg) => message::encode(8, msg, buf),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            StreamRequest::None => 0,
            StreamRequest::Close(msg) => message::encoded_len(1, msg),
            StreamRequest::Execute(msg) => message::encoded_len(2, msg),
            StreamRequest::Batch(msg) => message::encoded_len(3, msg),
            StreamRequest::Sequence(msg) => message::encoded_len(4, msg),
            StreamRequest::Describe(msg) => message::encoded_len(5, msg),
            StreamRequest::StoreSql(msg) => message::encoded_len(6, msg),
            StreamRequest::CloseSql(msg) => message::encoded_len(7, msg),
            StreamRequest::GetAutocommit(msg) => message::encoded_len(8, msg),
        }
    }

    fn merge_field<B>(
        &mut self,
        _tag: u32,
        _wire_type: WireType,
        _buf: &mut B,
        _ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        panic!("StreamRequest can only be encoded, not decoded")
    }

    fn clear(&mut self) {
        panic!("StreamRequest can only be encoded, not decoded")
    }
}

impl prost::Message for StreamResult {
    fn encode_raw<B>(&self, _buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        panic!("StreamResult can only be decoded, not encoded")
    }

    fn encoded_len(&self) -> usize {
        panic!("StreamResult can only be decoded, not encoded")
    }

    fn merge_field<B>(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut B,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        match tag {
            1 => {
                let mut response = match replace(self, StreamResult::None) {
                    StreamResult::Ok { response } => response,
                    _ => StreamResponse::None,
                };
                message::merge(wire_type, &mut response, buf, ctx)?;
                *self = StreamResult::Ok { response };
            }
            2 => {
                let mut error = match replace(self, StreamResult::None) {
                    StreamResult::Error { error } => error,
                    _ => Default::default(),
                };
                message::merge(wire_type, &mut error, buf, ctx)?;
                *self = StreamResult::Error { error };
            }
            _ => skip_field(wire_type, tag, buf, ctx)?,
        }
        Ok(())
    }

    fn clear(&mut self) {
        *self = StreamResult::None;
    }
}

impl prost::Message for StreamResponse {
    fn encode_raw<B>(&self, _buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        panic!("StreamResponse can only be decoded, not encoded")
    }

    fn encoded_len(&self) -> usize {
        panic!("StreamResponse can only be decoded, not encoded")
    }

    fn merge_field<B>(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut B,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        macro_rules! merge {
            ($variant:ident) => {{
                let mut msg = match replace(self, StreamResponse::None) {
                    StreamResponse::$variant(msg) => msg,
                    _ => Default::default(),
                };
                message::merge(wire_type, &mut msg, buf, ctx)?;
                *self = StreamResponse::$variant(msg);
            }};
        }

        match tag {
            1 => merge!(Close),
            2 => merge!(Execute),
            3 => merge!(Batch),
            4 => merge!(Sequence),
            5 => merge!(Describe),
            6 => merge!(StoreSql),
            7 => merge!(CloseSql),
            8 => merge!(GetAutocommit),
            _ => skip_field(wire_type, tag, buf, ctx)?,
        }
        Ok(())
    }

    fn clear(&mut self) {
        *self = StreamResponse::None;
    }
}

impl prost::Message for BatchCond {
    fn encode_raw<B>(&self, buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        match self {
            BatchCond::None => {}
            BatchCond::Ok { step } => uint32::encode(1, step, buf),
            BatchCond::Error { step } => uint32::encode(2, step, buf),
            BatchCond::Not { cond } => message::encode(3, &**cond, buf),
            BatchCond::And(cond_list) => message::encode(4, cond_list, buf),
            BatchCond::Or(cond_list) => message::encode(5, cond_list, buf),
            BatchCond::IsAutocommit {} => encode_unit(6, buf),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            BatchCond::None => 0,
            BatchCond::Ok { step } => uint32::encoded_len(1, step),
            BatchCond::Error { step } => uint32::encoded_len(2, step),
            BatchCond::Not { cond } => message::encoded_len(3, &**cond),
            BatchCond::And(cond_list) => message::encoded_len(4, cond_list),
            BatchCond::Or(cond_list) => message::encoded_len(5, cond_list),
            BatchCond::IsAutocommit {} => unit_len(6),
        }
    }

    fn merge_field<B>(
        &mut self,
        _tag: u32,
        _wire_type: WireType,
        _buf: &mut B,
        _ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        panic!("BatchCond can only be encoded, not decoded")
    }

    fn clear(&mut self) {
        *self = BatchCond::None;
    }
}

impl prost::Message for BatchResult {
    fn encode_raw<B>(&self, _buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        panic!("BatchResult can only be decoded, not encoded")
    }

    fn encoded_len(&self) -> usize {
        panic!("BatchResult can only be decoded, not encoded")
    }

    fn merge_field<B>(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut B,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        match tag {
            1 => {
                let mut entry = map_entry::MapEntry::default();
                message::merge(wire_type, &mut entry, buf, ctx)?;
                map_entry::put(&mut self.step_results, entry);
            }
            2 => {
                let mut entry = map_entry::MapEntry::default();
                message::merge(wire_type, &mut entry, buf, ctx)?;
                map_entry::put(&mut self.step_errors, entry);
            }
            _ => skip_field(wire_type, tag, buf, ctx)?,
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.step_results.clear();
        self.step_errors.clear();
    }
}

impl prost::Message for CursorEntry {
    fn encode_raw<B>(&self, _buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        panic!("CursorEntry can only be decoded, not encoded")
    }

    fn encoded_len(&self) -> usize {
        panic!("CursorEntry can only be decoded, not encoded")
    }

    fn merge_field<B>(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut B,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        macro_rules! merge {
            ($variant:ident) => {{
                let mut entry = match replace(self, CursorEntry::None) {
                    CursorEntry::$variant(entry) => entry,
                    _ => Default::default(),
                };
                message::merge(wire_type, &mut entry, buf, ctx)?;
                *self = CursorEntry::$variant(entry);
            }};
        }

        match tag {
            1 => merge!(StepBegin),
            2 => merge!(StepEnd),
            3 => merge!(StepError),
            4 => {
                let mut row = match replace(self, CursorEntry::None) {
                    CursorEntry::Row { row } => row,
                    _ => Default::default(),
                };
                message::merge(wire_type, &mut row, buf, ctx)?;
                *self = CursorEntry::Row { row };
            }
            5 => {
                let mut error = match replace(self, CursorEntry::None) {
                    CursorEntry::Error { error } => error,
                    _ => Default::default(),
                };
                message::merge(wire_type, &mut error, buf, ctx)?;
                *self = CursorEntry::Error { error };
            }
            _ => skip_field(wire_type, tag, buf, ctx)?,
        }
        Ok(())
    }

    fn clear(&mut self) {
        *self = CursorEntry::None;
    }
}

impl prost::Message for Value {
    fn encode_raw<B>(&self, buf: &mut B)
    where
        B: BufMut,
        Self: Sized,
    {
        match self {
            Value::None => {}
            Value::Null => encode_unit(1, buf),
            Value::Integer { value } => sint64::encode(2, value, buf),
            Value::Float { value } => double::encode(3, value, buf),
            Value::Text { value } => encode_str(4, value, buf),
            Value::Blob { value } => bytes::encode(5, value, buf),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Value::None => 0,
            Value::Null => unit_len(1),
            Value::Integer { value } => sint64::encoded_len(2, value),
            Value::Float { value } => double::encoded_len(3, value),
            Value::Text { value } => str_len(4, value),
            Value::Blob { value } => bytes::encoded_len(5, value),
        }
    }

    fn merge_field<B>(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut B,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        B: Buf,
        Self: Sized,
    {
        match tag {
            1 => {
                skip_field(wire_type, tag, buf, ctx)?;
                *self = Value::Null
            }
            2 => {
                let mut value = 0;
                sint64::merge(wire_type, &mut value, buf, ctx)?;
                *self = Value::Integer { value };
            }
            3 => {
                let mut value = 0.;
                double::merge(wire_type, &mut value, buf, ctx)?;
                *self = Value::Float { value };
            }
            4 => {
                let mut value = String::new();
                string::merge(wire_type, &mut value, buf, ctx)?;
                let value: Arc<str> = value.into();
                *self = Value::Text { value };
            }
            5 => {
                let mut value = Bytes::new();
                bytes::merge(wire_type, &mut value, buf, ctx)?;
                *self = Value::Blob { value };
            }
            _ => {
                skip_field(wire_type, tag, buf, ctx)?;
            }
        }
        Ok(())
    }

    fn clear(&mut self) {
        *self = Value::None;
    }
}

/// Decodes protobuf `map<uint32, M>` entries into an index-addressed
/// `Vec<Option<M>>`.
mod map_entry {
    use ::bytes::Buf;
    use prost::encoding::{message, skip_field, uint32, DecodeContext, WireType};
    use prost::DecodeError;

    #[derive(Debug, Default)]
    pub struct MapEntry<M> {
        pub key: u32,
        pub value: M,
    }

    impl<M> prost::Message for MapEntry<M>
    where
        M: prost::Message + Default,
    {
        fn encode_raw<B>(&self, _buf: &mut B)
        where
            B: ::bytes::BufMut,
            Self: Sized,
        {
            panic!("MapEntry can only be decoded, not encoded")
        }

        fn encoded_len(&self) -> usize {
            panic!("MapEntry can only be decoded, not encoded")
        }

        fn merge_field<B>(
            &mut self,
            tag: u32,
            wire_type: WireType,
            buf: &mut B,
            ctx: DecodeContext,
        ) -> Result<(), DecodeError>
        where
            B: Buf,
            Self: Sized,
        {
            match tag {
                1 => uint32::merge(wire_type, &mut self.key, buf, ctx)?,
                2 => message::merge(wire_type, &mut self.value, buf, ctx)?,
                _ => skip_field(wire_type, tag, buf, ctx)?,
            }
            Ok(())
        }

        fn clear(&mut self) {
            self.key = 0;
            self.value = M::default();
        }
    }

    pub fn put<M>(values: &mut Vec<Option<M>>, entry: MapEntry<M>) {
        let index = entry.key as usize;
        if values.len() <= index {
            values.resize_with(index + 1, || None);
        }
        values[index] = Some(entry.value);
    }
}

/// `NULL` and `is_autocommit` are empty nested messages on the wire: a
/// field key followed by a zero length, nothing else.
fn encode_unit(tag: u32, buf: &mut impl BufMut) {
    encode_key(tag, WireType::LengthDelimited, buf);
    buf.put_u8(0);
}

fn unit_len(tag: u32) -> usize {
    key_len(tag) + 1
}

/// Length-delimited UTF-8, for text values that live behind an `Arc<str>`
/// and so cannot use prost's `String`-only helpers.
fn encode_str(tag: u32, value: &str, buf: &mut impl BufMut) {
    encode_key(tag, WireType::LengthDelimited, buf);
    encode_varint(value.len() as u64, buf);
    buf.put_slice(value.as_bytes());
}

fn str_len(tag: u32, value: &str) -> usize {
    key_len(tag) + encoded_len_varint(value.len() as u64) + value.len()
}

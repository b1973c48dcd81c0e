//! Structures in Hrana that are common for WebSockets and HTTP.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct Error {
    #[prost(string, tag = "1")]
    pub message: String,
    #[serde(default)]
    #[prost(string, optional, tag = "2")]
    pub code: Option<String>,
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct Stmt {
    #[serde(default)]
    #[prost(string, optional, tag = "1")]
    pub sql: Option<String>,
    #[serde(default)]
    #[prost(int32, optional, tag = "2")]
    pub sql_id: Option<i32>,
    #[serde(default)]
    #[prost(message, repeated, tag = "3")]
    pub args: Vec<Value>,
    #[serde(default)]
    #[prost(message, repeated, tag = "4")]
    pub named_args: Vec<NamedArg>,
    #[serde(default)]
    #[prost(bool, optional, tag = "5")]
    pub want_rows: Option<bool>,
}

impl Stmt {
    pub fn new<S: Into<String>>(sql: S, want_rows: bool) -> Self {
        Stmt {
            sql: Some(sql.into()),
            sql_id: None,
            args: vec![],
            named_args: vec![],
            want_rows: Some(want_rows),
        }
    }

    pub fn with_sql_id(sql_id: i32, want_rows: bool) -> Self {
        Stmt {
            sql: None,
            sql_id: Some(sql_id),
            args: vec![],
            named_args: vec![],
            want_rows: Some(want_rows),
        }
    }

    pub fn bind(&mut self, value: Value) {
        self.args.push(value);
    }

    pub fn bind_named(&mut self, name: String, value: Value) {
        self.named_args.push(NamedArg { name, value });
    }
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct NamedArg {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, required, tag = "2")]
    pub value: Value,
}

#[derive(Clone, Serialize, Deserialize, prost::Message)]
pub struct StmtResult {
    #[serde(default)]
    #[prost(message, repeated, tag = "1")]
    pub cols: Vec<Col>,
    #[serde(default)]
    #[prost(message, repeated, tag = "2")]
    pub rows: Vec<Row>,
    #[prost(uint64, tag = "3")]
    pub affected_row_count: u64,
    #[serde(default, with = "option_i64_as_str")]
    #[prost(sint64, optional, tag = "4")]
    pub last_insert_rowid: Option<i64>,
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct Col {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[serde(default)]
    #[prost(string, optional, tag = "2")]
    pub decltype: Option<String>,
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
#[serde(transparent)]
pub struct Row {
    #[prost(message, repeated, tag = "1")]
    pub values: Vec<Value>,
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct Batch {
    #[prost(message, repeated, tag = "1")]
    pub steps: Vec<BatchStep>,
}

impl Batch {
    pub fn single(stmt: Stmt) -> Self {
        Batch {
            steps: vec![BatchStep {
                condition: None,
                stmt,
            }],
        }
    }
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct BatchStep {
    #[serde(default)]
    #[prost(message, optional, tag = "1")]
    pub condition: Option<BatchCond>,
    #[prost(message, required, tag = "2")]
    pub stmt: Stmt,
}

#[derive(Clone, Deserialize, Serialize, Debug, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchCond {
    #[serde(skip)]
    #[default]
    None,
    Ok {
        step: u32,
    },
    Error {
        step: u32,
    },
    Not {
        cond: Box<BatchCond>,
    },
    And(BatchCondList),
    Or(BatchCondList),
    IsAutocommit {},
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct BatchCondList {
    #[prost(message, repeated, tag = "1")]
    pub conds: Vec<BatchCond>,
}

#[derive(Clone, Deserialize, Serialize, Debug, Default)]
pub struct BatchResult {
    #[serde(default)]
    pub step_results: Vec<Option<StmtResult>>,
    #[serde(default)]
    pub step_errors: Vec<Option<Error>>,
}

#[derive(Clone, Deserialize, Serialize, Debug, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CursorEntry {
    #[serde(skip)]
    #[default]
    None,
    StepBegin(StepBeginEntry),
    StepEnd(StepEndEntry),
    StepError(StepErrorEntry),
    Row {
        row: Row,
    },
    Error {
        error: Error,
    },
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct StepBeginEntry {
    #[prost(uint32, tag = "1")]
    pub step: u32,
    #[prost(message, repeated, tag = "2")]
    pub cols: Vec<Col>,
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct StepEndEntry {
    #[prost(uint64, tag = "1")]
    pub affected_row_count: u64,
    #[serde(default, with = "option_i64_as_str")]
    #[prost(sint64, optional, tag = "2")]
    pub last_insert_rowid: Option<i64>,
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct StepErrorEntry {
    #[prost(uint32, tag = "1")]
    pub step: u32,
    #[prost(message, required, tag = "2")]
    pub error: Error,
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct DescribeResult {
    #[serde(default)]
    #[prost(message, repeated, tag = "1")]
    pub params: Vec<DescribeParam>,
    #[serde(default)]
    #[prost(message, repeated, tag = "2")]
    pub cols: Vec<DescribeCol>,
    #[prost(bool, tag = "3")]
    pub is_explain: bool,
    #[prost(bool, tag = "4")]
    pub is_readonly: bool,
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct DescribeParam {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
}

#[derive(Clone, Deserialize, Serialize, prost::Message)]
pub struct DescribeCol {
    #[prost(string, tag = "1")]
    pub name: String,
    #[serde(default)]
    #[prost(string, optional, tag = "2")]
    pub decltype: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Value {
    #[serde(skip)]
    #[default]
    None,
    Null,
    Integer {
        #[serde(with = "i64_as_str")]
        value: i64,
    },
    Float {
        value: f64,
    },
    Text {
        value: Arc<str>,
    },
    Blob {
        #[serde(with = "bytes_as_base64", rename = "base64")]
        value: Bytes,
    },
}

/// 64-bit integers go over JSON as decimal strings, because JSON numbers
/// are doubles and would silently lose precision past 2^53.
mod i64_as_str {
    use serde::de::Error as _;
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
        let text = String::deserialize(de)?;
        text.parse().map_err(|_| {
            D::Error::custom(format_args!(
                "expected a 64-bit integer in a decimal string, got {text:?}"
            ))
        })
    }
}

/// Like `i64_as_str`, but the field may also be absent or null, and some
/// servers send it as a plain JSON number when it fits.
mod option_i64_as_str {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<i64>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => ser.collect_str(value),
            None => ser.serialize_none(),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(i64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
        match Option::<Repr>::deserialize(de)? {
            None => Ok(None),
            Some(Repr::Number(value)) => Ok(Some(value)),
            Some(Repr::Text(text)) => text.parse().map(Some).map_err(|_| {
                D::Error::custom(format_args!(
                    "expected a 64-bit integer in a decimal string, got {text:?}"
                ))
            }),
        }
    }
}

/// Blobs go over JSON as base64 without padding; padded input is accepted.
mod bytes_as_base64 {
    use base64::engine::general_purpose::STANDARD_NO_PAD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD_NO_PAD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(de)?;
        match STANDARD_NO_PAD.decode(text.trim_end_matches('=')) {
            Ok(decoded) => Ok(Bytes::from(decoded)),
            Err(err) => Err(D::Error::custom(format_args!("invalid base64 blob: {err}"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn value_json_shapes() {
        let v: Value = serde_json::from_str(r#"{"type": "null"}"#).unwrap();
        assert_eq!(v, Value::Null);

        let v: Value = serde_json::from_str(r#"{"type": "integer", "value": "-42"}"#).unwrap();
        assert_eq!(v, Value::Integer { value: -42 });

        let json = serde_json::to_string(&Value::Integer { value: i64::MAX }).unwrap();
        assert_eq!(json, r#"{"type":"integer","value":"9223372036854775807"}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Integer { value: i64::MAX });

        let json = serde_json::to_string(&Value::Integer { value: i64::MIN }).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Integer { value: i64::MIN });
    }

    #[test]
    fn blob_base64_round_trip() {
        let blob = Value::Blob {
            value: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef, 0x00]),
        };
        let json = serde_json::to_string(&blob).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);

        // Padded input is accepted too.
        let back: Value = serde_json::from_str(r#"{"type": "blob", "base64": "3q2+7wA="}"#).unwrap();
        assert_eq!(back, blob);
    }

    #[test]
    fn stmt_result_rowid_as_string() {
        let json = r#"{
            "cols": [{"name": "id", "decltype": null}],
            "rows": [[{"type": "integer", "value": "1"}]],
            "affected_row_count": 1,
            "last_insert_rowid": "9223372036854775807"
        }"#;
        let result: StmtResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.last_insert_rowid, Some(i64::MAX));
        assert_eq!(result.rows[0].values[0], Value::Integer { value: 1 });
    }

    #[test]
    fn batch_cond_json_shape() {
        let cond = BatchCond::Not {
            cond: Box::new(BatchCond::Ok { step: 3 }),
        };
        let json = serde_json::to_string(&cond).unwrap();
        assert_eq!(json, r#"{"type":"not","cond":{"type":"ok","step":3}}"#);
    }

    #[test]
    fn cursor_entry_json_shapes() {
        let entry: CursorEntry =
            serde_json::from_str(r#"{"type": "step_begin", "step": 0, "cols": [{"name": "x"}]}"#)
                .unwrap();
        match entry {
            CursorEntry::StepBegin(begin) => {
                assert_eq!(begin.step, 0);
                assert_eq!(begin.cols[0].name.as_deref(), Some("x"));
            }
            other => panic!("unexpected entry: {other:?}"),
        }

        let entry: CursorEntry = serde_json::from_str(
            r#"{"type": "step_end", "affected_row_count": 2, "last_insert_rowid": "7"}"#,
        )
        .unwrap();
        match entry {
            CursorEntry::StepEnd(end) => {
                assert_eq!(end.affected_row_count, 2);
                assert_eq!(end.last_insert_rowid, Some(7));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }
}

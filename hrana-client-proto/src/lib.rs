//! Wire-level types of the Hrana protocol, as seen from the client side.
//!
//! Every message exists in two encodings: JSON (via serde) and a compact
//! protobuf-compatible binary form (via prost). Plain messages derive both;
//! the tagged unions get hand-written [`prost::Message`] impls in the
//! `protobuf` module, implemented only in the direction the client uses
//! them (requests encode, responses decode).

pub mod http;
pub mod proto;
pub mod ws;

mod protobuf;

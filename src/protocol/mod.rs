//! Protocol module - wire types and the newline-delimited JSON codec.
//!
//! The wire format is JSON-RPC derived: one JSON object per line over a byte
//! stream. A request carries an `id` iff a reply is expected; a response
//! carries either a `result` or an `error` object.

mod line_codec;
mod message;

pub use line_codec::{default_encoder, encode_line, Encoder, LineDecoder, DEFAULT_MAX_LINE};
pub use message::{codes, Request, Response, RpcError};

//! Transport plumbing shared by the inbound subscribers and the publisher.
//!
//! Endpoints are plain `tcp://host:port` strings. Messages are framed as
//! length-prefixed parts (see `wire`); a frame travels as two parts,
//! `[json header, payload]`.

mod endpoint;
pub mod wire;

pub use endpoint::{parse_endpoint, Endpoint};
pub use wire::{encode_message, write_message, MessageDecoder};

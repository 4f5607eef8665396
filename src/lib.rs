#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation, // TODO
    clippy::too_many_lines, // TODO
)]

//! A pure HTTP/2 (RFC 7540/9113) core: frame codec, HPACK, flow control,
//! stream registry/state machine, and connection driver. Operates over any
//! already-established `AsyncRead + AsyncWrite` byte stream — TLS/ALPN
//! negotiation, HTTP/1.1 upgrade parsing, and application routing are the
//! caller's concern (see [`client`] for one such caller, a minimal
//! TLS-connecting CLI client built on top of this crate).

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frame;
pub mod hpack;
pub mod priority;
pub mod registry;
pub mod settings;
pub mod stream;
pub mod types;

pub use bytes::Bytes;
pub use config::Config;
pub use connection::{
    BodyReader, ClientRequest, ClientResponse, Connection, IncomingPush, IncomingRequest, StreamHandle,
};
pub use error::{Error, ErrorCode, Scope, UsageError};
pub use frame::Frame;
pub use registry::Role;
pub use types::{HeaderField, HeaderList, StreamId};
pub use url::Url;

//! Wire protocol of the XPAD acquisition server.
//!
//! - [`connection`]: buffered socket with byte push-back
//! - [`response`]: classification of response lines into [`ResponseEvent`]s
//! - [`client`]: command/result exchanges ([`ProtocolClient`])
//! - [`transfer`]: configuration-file upload and download

pub mod client;
pub mod connection;
pub mod response;
pub mod transfer;

pub use client::{ProtocolClient, DEFAULT_PORT};
pub use connection::Connection;
pub use response::{read_event, NumericKind, ResponseEvent};

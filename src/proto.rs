//! Streaming text-envelope protocol.
//!
//! Every sub-protocol in the system shares one wire format:
//!
//! ```text
//! PROTOCOL METHOD\r\n
//! Header-Name: header value\r\n
//! ...\r\n
//! content-length: <n>\r\n        (only if a body follows)
//! \r\n
//! <n raw bytes>                  (only if content-length was present)
//! ```
//!
//! [`envelope::Packet`] is the parsed form, [`parser::PacketParser`] the
//! incremental decoder, [`grammar`] the pluggable line grammars, and
//! [`packets`] the typed views of the sub-protocols carried on top.

pub mod envelope;
pub mod grammar;
pub mod line;
pub mod packets;
pub mod parser;

use thiserror::Error;

/// A protocol parse failure.
///
/// Always recoverable at stream level: the parser discards the packet in
/// progress and resyncs on the next first line; typed packet conversions
/// leave the envelope untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The `PROTOCOL METHOD` line was malformed.
    #[error("malformed first line: {reason}")]
    FirstLine {
        /// What the grammar objected to.
        reason: &'static str,
    },
    /// A header line was malformed.
    #[error("malformed header line: {reason}")]
    Header {
        /// What the grammar objected to.
        reason: &'static str,
    },
    /// `content-length` appeared twice in one packet.
    #[error("content-length appeared twice")]
    DuplicateContentLength,
    /// `content-length` was not a positive integer.
    #[error("invalid content-length {value:?}")]
    InvalidContentLength {
        /// The offending header value.
        value: String,
    },
    /// The stream ended in the middle of a packet.
    #[error("stream ended inside a packet")]
    TruncatedPacket,
    /// A typed packet was built from an envelope of another protocol.
    #[error("unexpected protocol {0:?}")]
    WrongProtocol(String),
    /// A typed packet was built from an envelope of another method.
    #[error("unexpected method {0:?}")]
    WrongMethod(String),
    /// A typed packet needs a header the envelope does not carry.
    #[error("missing header {0:?}")]
    MissingHeader(&'static str),
    /// A typed packet header value failed to parse.
    #[error("invalid value {value:?} for header {name:?}")]
    InvalidHeader {
        /// Header name.
        name: &'static str,
        /// The offending value.
        value: String,
    },
}

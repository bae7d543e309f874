//! Pluggable line grammars for the packet state machine.
//!
//! The state machine is identical for every envelope flavor: first
//! line, header lines, optional counted body. What varies is how the
//! first line and a header line are interpreted, so exactly those two
//! operations form the [`Grammar`] strategy, selected when the parser is
//! constructed. New envelope flavors plug in without touching the
//! parser.

use crate::proto::ParseError;
use crate::proto::envelope::{Headers, Packet};

/// Accumulates one packet while its lines are being parsed.
#[derive(Debug, Default)]
pub struct PacketBuilder {
    protocol: String,
    method: String,
    headers: Headers,
    content_length: Option<usize>,
}

impl PacketBuilder {
    /// Sets the protocol token.
    pub fn protocol(&mut self, protocol: impl Into<String>) {
        self.protocol = protocol.into();
    }

    /// Sets the method token.
    pub fn method(&mut self, method: impl Into<String>) {
        self.method = method.into();
    }

    /// Stores one header.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Declares the body size announced by `content-length`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::DuplicateContentLength`] on a second
    /// declaration.
    pub fn declare_content_length(&mut self, size: usize) -> Result<(), ParseError> {
        if self.content_length.is_some() {
            return Err(ParseError::DuplicateContentLength);
        }
        self.content_length = Some(size);
        Ok(())
    }

    /// Declared body size, or 0 when no body was announced.
    #[must_use]
    pub fn content_length(&self) -> usize {
        self.content_length.unwrap_or(0)
    }

    /// Finalizes the packet with its body.
    #[must_use]
    pub fn finish(self, body: Vec<u8>) -> Packet {
        Packet {
            protocol: self.protocol,
            method: self.method,
            headers: self.headers,
            body,
        }
    }
}

/// Line-level grammar: how a first line and a header line are read.
pub trait Grammar: Send + 'static {
    /// Parses the opening line of a packet.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] on any structural violation.
    fn first_line(&self, line: &[u8], packet: &mut PacketBuilder) -> Result<(), ParseError>;

    /// Parses one non-empty header line.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] on any structural violation.
    fn header_line(&self, line: &[u8], packet: &mut PacketBuilder) -> Result<(), ParseError>;
}

/// Is `token` an uppercase letter followed by uppercase/digits/underscores?
fn is_wire_token(token: &[u8]) -> bool {
    let Some((&first, rest)) = token.split_first() else {
        return false;
    };
    first.is_ascii_uppercase()
        && rest
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || *b == b'_')
}

/// Splits a header line into its validated name and value parts.
///
/// Shared by the grammars: `name` starts with a letter and continues
/// with letters/digits/`_`/`-`; the value starts after the colon once
/// leading spaces are skipped and must be printable. An empty value is
/// reported as `Ok((name, ""))` and left to the caller's policy.
fn split_header(line: &[u8]) -> Result<(&str, &str), ParseError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::Header {
            reason: "missing colon",
        })?;
    let (name, rest) = (&line[..colon], &line[colon + 1..]);

    let Some((&first, tail)) = name.split_first() else {
        return Err(ParseError::Header {
            reason: "empty header name",
        });
    };
    if !first.is_ascii_alphabetic()
        || !tail
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
    {
        return Err(ParseError::Header {
            reason: "header name must be [A-Za-z][A-Za-z0-9_-]*",
        });
    }

    let value = &rest[rest.iter().take_while(|&&b| b == b' ').count()..];
    if !value.iter().all(|&b| (32..126).contains(&b)) {
        return Err(ParseError::Header {
            reason: "header value must be printable",
        });
    }

    // Both halves are validated ASCII at this point.
    Ok((
        std::str::from_utf8(name).unwrap_or_default(),
        std::str::from_utf8(value).unwrap_or_default(),
    ))
}

/// Parses and validates a `content-length` value.
fn body_size(value: &str) -> Result<usize, ParseError> {
    match value.parse::<i64>() {
        Ok(size) if size > 0 => Ok(size as usize),
        _ => Err(ParseError::InvalidContentLength {
            value: value.to_owned(),
        }),
    }
}

/// The native envelope grammar: `PROTOCOL METHOD` first line, strict
/// uppercase tokens, mandatory header values.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeGrammar;

impl Grammar for EnvelopeGrammar {
    fn first_line(&self, line: &[u8], packet: &mut PacketBuilder) -> Result<(), ParseError> {
        if line.is_empty() {
            return Err(ParseError::FirstLine {
                reason: "empty first line",
            });
        }
        let space = line
            .iter()
            .position(|&b| b == b' ')
            .ok_or(ParseError::FirstLine {
                reason: "missing method token",
            })?;
        let (protocol, method) = (&line[..space], &line[space + 1..]);
        if !is_wire_token(protocol) {
            return Err(ParseError::FirstLine {
                reason: "protocol token must be [A-Z][A-Z0-9_]*",
            });
        }
        if !is_wire_token(method) {
            return Err(ParseError::FirstLine {
                reason: "method token must be [A-Z][A-Z0-9_]*",
            });
        }
        packet.protocol(String::from_utf8_lossy(protocol));
        packet.method(String::from_utf8_lossy(method));
        Ok(())
    }

    fn header_line(&self, line: &[u8], packet: &mut PacketBuilder) -> Result<(), ParseError> {
        let (name, value) = split_header(line)?;
        if value.is_empty() {
            return Err(ParseError::Header {
                reason: "header without value",
            });
        }
        if name.eq_ignore_ascii_case("content-length") {
            packet.declare_content_length(body_size(value)?)
        } else {
            packet.header(name, value);
            Ok(())
        }
    }
}

/// HTTP-response flavor of the envelope: `HTTP/x.y CODE description`
/// first line, lowercased header names, empty values tolerated.
///
/// The status line maps onto the common packet shape: the version
/// becomes the protocol, the status code the method, and the
/// description an `HTTP-code` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpGrammar;

impl Grammar for HttpGrammar {
    fn first_line(&self, line: &[u8], packet: &mut PacketBuilder) -> Result<(), ParseError> {
        let mut parts = line.splitn(3, |&b| b == b' ');

        let version = parts.next().unwrap_or_default();
        if version.is_empty()
            || !version
                .iter()
                .all(|b| b.is_ascii_alphanumeric() || *b == b'/' || *b == b'.')
        {
            return Err(ParseError::FirstLine {
                reason: "invalid HTTP version",
            });
        }

        let code = parts.next().ok_or(ParseError::FirstLine {
            reason: "missing HTTP status code",
        })?;
        if code.is_empty() || !code.iter().all(u8::is_ascii_digit) {
            return Err(ParseError::FirstLine {
                reason: "invalid HTTP status code",
            });
        }

        let description = parts.next().unwrap_or_default();
        if !description
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b' ')
        {
            return Err(ParseError::FirstLine {
                reason: "invalid HTTP status description",
            });
        }

        packet.protocol(String::from_utf8_lossy(version));
        packet.method(String::from_utf8_lossy(code));
        packet.header("HTTP-code", String::from_utf8_lossy(description));
        Ok(())
    }

    fn header_line(&self, line: &[u8], packet: &mut PacketBuilder) -> Result<(), ParseError> {
        let (name, value) = split_header(line)?;
        let name = name.to_ascii_lowercase();
        if name == "content-length" {
            packet.declare_content_length(body_size(value)?)
        } else {
            packet.header(name, value);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_first(line: &[u8]) -> Result<PacketBuilder, ParseError> {
        let mut builder = PacketBuilder::default();
        EnvelopeGrammar.first_line(line, &mut builder)?;
        Ok(builder)
    }

    #[test]
    fn first_line_tokens() {
        let builder = envelope_first(b"VCP2P FRAGMENT").unwrap();
        let packet = builder.finish(Vec::new());
        assert_eq!(packet.protocol, "VCP2P");
        assert_eq!(packet.method, "FRAGMENT");
    }

    #[test]
    fn first_line_rejects_missing_method() {
        assert_eq!(
            envelope_first(b"VCP2P").unwrap_err(),
            ParseError::FirstLine {
                reason: "missing method token"
            }
        );
    }

    #[test]
    fn first_line_rejects_lowercase() {
        assert!(envelope_first(b"vcp2p FRAGMENT").is_err());
        assert!(envelope_first(b"VCP2P fragment").is_err());
    }

    #[test]
    fn header_line_splits_and_trims() {
        let mut builder = PacketBuilder::default();
        EnvelopeGrammar
            .header_line(b"Source:   10.0.0.1:4000", &mut builder)
            .unwrap();
        let packet = builder.finish(Vec::new());
        assert_eq!(packet.header("source"), Some("10.0.0.1:4000"));
    }

    #[test]
    fn header_value_keeps_interior_spaces() {
        let mut builder = PacketBuilder::default();
        EnvelopeGrammar
            .header_line(b"Note: a b  c", &mut builder)
            .unwrap();
        assert_eq!(builder.finish(Vec::new()).header("Note"), Some("a b  c"));
    }

    #[test]
    fn header_line_rejects_missing_colon() {
        let mut builder = PacketBuilder::default();
        assert_eq!(
            EnvelopeGrammar
                .header_line(b"no colon here", &mut builder)
                .unwrap_err(),
            ParseError::Header {
                reason: "missing colon"
            }
        );
    }

    #[test]
    fn content_length_duplicate_and_invalid() {
        let mut builder = PacketBuilder::default();
        EnvelopeGrammar
            .header_line(b"content-length: 10", &mut builder)
            .unwrap();
        assert_eq!(
            EnvelopeGrammar
                .header_line(b"Content-Length: 20", &mut builder)
                .unwrap_err(),
            ParseError::DuplicateContentLength
        );

        let mut builder = PacketBuilder::default();
        assert!(matches!(
            EnvelopeGrammar
                .header_line(b"content-length: -5", &mut builder)
                .unwrap_err(),
            ParseError::InvalidContentLength { .. }
        ));
        assert!(matches!(
            EnvelopeGrammar
                .header_line(b"content-length: many", &mut builder)
                .unwrap_err(),
            ParseError::InvalidContentLength { .. }
        ));
    }

    #[test]
    fn http_status_line() {
        let mut builder = PacketBuilder::default();
        HttpGrammar
            .first_line(b"HTTP/1.1 200 OK", &mut builder)
            .unwrap();
        let packet = builder.finish(Vec::new());
        assert_eq!(packet.protocol, "HTTP/1.1");
        assert_eq!(packet.method, "200");
        assert_eq!(packet.header("HTTP-code"), Some("OK"));
    }

    #[test]
    fn http_headers_lowercased_and_empty_values_ok() {
        let mut builder = PacketBuilder::default();
        HttpGrammar
            .header_line(b"X-Empty:", &mut builder)
            .unwrap();
        let packet = builder.finish(Vec::new());
        assert_eq!(packet.header("x-empty"), Some(""));
        assert_eq!(packet.headers.iter().next().unwrap().0, "x-empty");
    }

    #[test]
    fn http_rejects_alphabetic_code() {
        let mut builder = PacketBuilder::default();
        assert!(
            HttpGrammar
                .first_line(b"HTTP/1.1 abc OK", &mut builder)
                .is_err()
        );
    }
}

//! Incremental packet state machine over the line parser.

use crate::proto::ParseError;
use crate::proto::envelope::Packet;
use crate::proto::grammar::{EnvelopeGrammar, Grammar, PacketBuilder};
use crate::proto::line::LineParser;
use crate::trace::warn;

/// Where the next buffered bytes belong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FirstLine,
    Headers,
    Content,
}

/// Streaming packet decoder.
///
/// Feed raw stream bytes with [`PacketParser::eat`], then loop on
/// [`PacketParser::get_packet`] to drain every packet fully contained in
/// the buffer. A structural violation aborts only the packet in
/// progress: the error is returned once and the parser has already
/// resynchronized on the next first line.
///
/// # Example
///
/// ```
/// use framewire::proto::parser::PacketParser;
///
/// let mut parser = PacketParser::new();
/// parser.eat(b"VCP2P RTTREQ\r\nSource: 10.0.0.1:9\r\n\r\n");
/// let packet = parser.get_packet().unwrap().unwrap();
/// assert_eq!(packet.method, "RTTREQ");
/// assert!(parser.get_packet().unwrap().is_none());
/// ```
pub struct PacketParser {
    lines: LineParser,
    grammar: Box<dyn Grammar>,
    state: State,
    building: PacketBuilder,
}

impl Default for PacketParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketParser {
    /// Creates a parser for the native envelope grammar.
    #[must_use]
    pub fn new() -> Self {
        Self::with_grammar(EnvelopeGrammar)
    }

    /// Creates a parser for a specific [`Grammar`].
    #[must_use]
    pub fn with_grammar(grammar: impl Grammar) -> Self {
        Self {
            lines: LineParser::new(),
            grammar: Box::new(grammar),
            state: State::FirstLine,
            building: PacketBuilder::default(),
        }
    }

    /// Appends raw stream bytes.
    pub fn eat(&mut self, data: &[u8]) {
        self.lines.push(data);
    }

    /// Advances the state machine as far as buffered data allows.
    ///
    /// Returns `Ok(Some(packet))` for each completed packet, `Ok(None)`
    /// once the buffer is exhausted mid-packet (feed more bytes and call
    /// again).
    ///
    /// # Errors
    ///
    /// Returns the structural violation that aborted the in-progress
    /// packet. The parser has already discarded it and reset to the
    /// first-line state; subsequent calls continue with the remaining
    /// buffered bytes.
    pub fn get_packet(&mut self) -> Result<Option<Packet>, ParseError> {
        match self.advance() {
            Ok(done) => Ok(done),
            Err(error) => {
                warn!(error = %error, "parse failure, dropping packet in progress");
                self.building = PacketBuilder::default();
                self.state = State::FirstLine;
                Err(error)
            }
        }
    }

    /// Declares the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::TruncatedPacket`] if the stream stopped in
    /// the middle of a packet, most commonly before the declared
    /// `content-length` bytes arrived.
    pub fn finish(&self) -> Result<(), ParseError> {
        if self.state == State::FirstLine && self.lines.is_empty() {
            Ok(())
        } else {
            Err(ParseError::TruncatedPacket)
        }
    }

    fn advance(&mut self) -> Result<Option<Packet>, ParseError> {
        loop {
            match self.state {
                State::FirstLine => {
                    let Some(line) = self.lines.pop_line() else {
                        return Ok(None);
                    };
                    self.grammar.first_line(&line, &mut self.building)?;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some(line) = self.lines.pop_line() else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = State::Content;
                    } else {
                        self.grammar.header_line(&line, &mut self.building)?;
                    }
                }
                State::Content => {
                    let size = self.building.content_length();
                    let body = if size > 0 {
                        let Some(body) = self.lines.pop_data(size) else {
                            return Ok(None);
                        };
                        body
                    } else {
                        Vec::new()
                    };
                    let packet = std::mem::take(&mut self.building).finish(body);
                    self.state = State::FirstLine;
                    return Ok(Some(packet));
                }
            }
        }
    }
}

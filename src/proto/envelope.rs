//! The shared wire envelope: protocol, method, headers, body.

use std::fmt;

/// Insertion-ordered header collection with case-insensitive names.
///
/// Header order is preserved exactly as inserted, which keeps encoded
/// output deterministic; lookups ignore ASCII case per the wire rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing a same-named (case-insensitive) one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .0
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    /// Looks a header up by case-insensitive name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Iterates headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no header is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One parsed (or to-be-encoded) wire envelope.
///
/// Immutable once built by the parser; encoders construct it field by
/// field and call [`Packet::encode`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// First token of the first line, e.g. `VCP2P`.
    pub protocol: String,
    /// Second token of the first line, e.g. `FRAGMENT`.
    pub method: String,
    /// Named header values, excluding `content-length`.
    pub headers: Headers,
    /// Raw body bytes; empty when no `content-length` was declared.
    pub body: Vec<u8>,
}

impl Packet {
    /// Shortcut for [`Headers::get`].
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Serializes the packet into its wire form.
    ///
    /// `content-length` is emitted exactly when the body is non-empty;
    /// it is derived from the body and never stored as a header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(64 + self.body.len());
        wire.extend_from_slice(self.protocol.as_bytes());
        wire.push(b' ');
        wire.extend_from_slice(self.method.as_bytes());
        wire.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            wire.extend_from_slice(name.as_bytes());
            wire.extend_from_slice(b": ");
            wire.extend_from_slice(value.as_bytes());
            wire.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() {
            wire.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }
        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(&self.body);
        wire
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}", self.protocol, self.method)?;
        for (name, value) in self.headers.iter() {
            write!(f, " {name}: {value};")?;
        }
        write!(f, " body {} bytes]", self.body.len())
    }
}

//! Typed views of the sub-protocols carried on the envelope.
//!
//! Two sub-protocols share the `VCP2P` wire protocol:
//!
//! - fragment transport (`FRAGMENT`): one MTU-sized slice of a frame,
//!   with the frame's timestamp, total size, slice index and origin;
//! - RTT probes (`RTTREQ`/`RTTREP`): delay measurement round trips; the
//!   reply echoes the request's send time back toward its source.
//!
//! Each type converts losslessly to and from [`Packet`]; conversions
//! from foreign or malformed envelopes fail with a [`ParseError`].

use std::str::FromStr;

use crate::media::FrameTimestamp;
use crate::net::Endpoint;
use crate::proto::ParseError;
use crate::proto::envelope::Packet;

/// Wire protocol token shared by all sub-protocols in this crate.
pub const PROTOCOL: &str = "VCP2P";

/// Method token of fragment packets.
pub const METHOD_FRAGMENT: &str = "FRAGMENT";
/// Method token of RTT requests.
pub const METHOD_RTT_REQUEST: &str = "RTTREQ";
/// Method token of RTT replies.
pub const METHOD_RTT_REPLY: &str = "RTTREP";

fn expect_envelope(packet: &Packet, method: &'static str) -> Result<(), ParseError> {
    if packet.protocol != PROTOCOL {
        return Err(ParseError::WrongProtocol(packet.protocol.clone()));
    }
    if packet.method != method {
        return Err(ParseError::WrongMethod(packet.method.clone()));
    }
    Ok(())
}

fn required_header<T: FromStr>(packet: &Packet, name: &'static str) -> Result<T, ParseError> {
    let value = packet.header(name).ok_or(ParseError::MissingHeader(name))?;
    value.parse().map_err(|_| ParseError::InvalidHeader {
        name,
        value: value.to_owned(),
    })
}

/// One MTU-sized slice of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPacket {
    /// Slice bytes, at most [`crate::media::MTU`].
    pub payload: Vec<u8>,
    /// Capture time shared by every fragment of the frame.
    pub timestamp: FrameTimestamp,
    /// Zero-based slice index within the frame.
    pub index: u32,
    /// Total size of the frame being carried, in bytes.
    pub frame_size: u32,
    /// Peer the frame originates from.
    pub source: Endpoint,
}

impl FragmentPacket {
    /// Builds the envelope form.
    #[must_use]
    pub fn to_packet(&self) -> Packet {
        let mut packet = Packet {
            protocol: PROTOCOL.to_owned(),
            method: METHOD_FRAGMENT.to_owned(),
            ..Packet::default()
        };
        packet.headers.insert("Time", self.timestamp.to_string());
        packet.headers.insert("Number", self.index.to_string());
        packet.headers.insert("Size", self.frame_size.to_string());
        packet.headers.insert("Source", self.source.to_string());
        packet.body = self.payload.clone();
        packet
    }

    /// Serializes straight to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.to_packet().encode()
    }
}

impl TryFrom<Packet> for FragmentPacket {
    type Error = ParseError;

    fn try_from(packet: Packet) -> Result<Self, Self::Error> {
        expect_envelope(&packet, METHOD_FRAGMENT)?;
        Ok(Self {
            timestamp: required_header(&packet, "Time")?,
            index: required_header(&packet, "Number")?,
            frame_size: required_header(&packet, "Size")?,
            source: required_header(&packet, "Source")?,
            payload: packet.body,
        })
    }
}

/// Outbound half of an RTT probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttRequestPacket {
    /// Peer issuing the probe.
    pub source: Endpoint,
    /// Peer being probed.
    pub destination: Endpoint,
    /// When the probe left the source.
    pub send_time: FrameTimestamp,
}

impl RttRequestPacket {
    /// Creates a probe stamped with the current time.
    #[must_use]
    pub fn new(source: Endpoint, destination: Endpoint) -> Self {
        Self {
            source,
            destination,
            send_time: FrameTimestamp::now(),
        }
    }

    /// Builds the envelope form.
    #[must_use]
    pub fn to_packet(&self) -> Packet {
        rtt_packet(METHOD_RTT_REQUEST, self.source, self.destination, self.send_time)
    }

    /// Serializes straight to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.to_packet().encode()
    }
}

impl TryFrom<Packet> for RttRequestPacket {
    type Error = ParseError;

    fn try_from(packet: Packet) -> Result<Self, Self::Error> {
        expect_envelope(&packet, METHOD_RTT_REQUEST)?;
        Ok(Self {
            source: required_header(&packet, "Source")?,
            destination: required_header(&packet, "Destination")?,
            send_time: required_header(&packet, "Time")?,
        })
    }
}

/// Returning half of an RTT probe, echoing the request's send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttReplyPacket {
    /// Peer answering the probe.
    pub source: Endpoint,
    /// Peer that issued the probe.
    pub destination: Endpoint,
    /// Send time copied verbatim from the request.
    pub send_time: FrameTimestamp,
}

impl RttReplyPacket {
    /// Builds the reply to `request`: directions swapped, send time
    /// echoed so the prober can compute the round trip on arrival.
    #[must_use]
    pub fn answering(request: &RttRequestPacket) -> Self {
        Self {
            source: request.destination,
            destination: request.source,
            send_time: request.send_time,
        }
    }

    /// Builds the envelope form.
    #[must_use]
    pub fn to_packet(&self) -> Packet {
        rtt_packet(METHOD_RTT_REPLY, self.source, self.destination, self.send_time)
    }

    /// Serializes straight to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.to_packet().encode()
    }
}

impl TryFrom<Packet> for RttReplyPacket {
    type Error = ParseError;

    fn try_from(packet: Packet) -> Result<Self, Self::Error> {
        expect_envelope(&packet, METHOD_RTT_REPLY)?;
        Ok(Self {
            source: required_header(&packet, "Source")?,
            destination: required_header(&packet, "Destination")?,
            send_time: required_header(&packet, "Time")?,
        })
    }
}

fn rtt_packet(
    method: &str,
    source: Endpoint,
    destination: Endpoint,
    send_time: FrameTimestamp,
) -> Packet {
    let mut packet = Packet {
        protocol: PROTOCOL.to_owned(),
        method: method.to_owned(),
        ..Packet::default()
    };
    packet.headers.insert("Source", source.to_string());
    packet.headers.insert("Destination", destination.to_string());
    packet.headers.insert("Time", send_time.to_string());
    packet
}

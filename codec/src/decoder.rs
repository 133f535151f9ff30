// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Resumable packet decoding over a byte stream that may deliver a control
//! packet in several `read()` calls.

use crate::byte_array::ByteArray;
use crate::packet_id::PacketId;
use crate::packet_type::PacketType;
use crate::traits::DecodePacket;
use crate::v3::{
    ConnectAckPacket, ConnectPacket, DisconnectPacket, PingRequestPacket, PingResponsePacket,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket,
    UnsubscribePacket,
};
use crate::DecodeError;

/// Any one of the 14 MQTT 3.1.1 control packets, as produced by [`Decoder`].
#[derive(Clone, Debug, PartialEq)]
pub enum VariablePacket {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
}

impl VariablePacket {
    /// Packet id carried by packets that have one (`None` for PUBLISH at
    /// QoS 0 and for packet types with no packet id field at all).
    pub fn packet_id(&self) -> Option<PacketId> {
        match self {
            VariablePacket::Publish(p) => p.packet_id(),
            VariablePacket::PublishAck(p) => Some(p.packet_id()),
            VariablePacket::PublishReceived(p) => Some(p.packet_id()),
            VariablePacket::PublishRelease(p) => Some(p.packet_id()),
            VariablePacket::PublishComplete(p) => Some(p.packet_id()),
            VariablePacket::Subscribe(p) => Some(p.packet_id()),
            VariablePacket::SubscribeAck(p) => Some(p.packet_id()),
            VariablePacket::Unsubscribe(p) => Some(p.packet_id()),
            VariablePacket::UnsubscribeAck(p) => Some(p.packet_id()),
            _ => None,
        }
    }
}

/// Parse the fixed header directly out of a byte slice without going through
/// [`ByteArray`], so an incomplete header can be distinguished from a
/// malformed one.
///
/// Returns `Ok(None)` when `buf` doesn't yet hold a complete fixed header.
fn try_parse_fixed_header(buf: &[u8]) -> Result<Option<(PacketType, usize, usize)>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let packet_type = PacketType::from_byte(buf[0])?;

    let mut multiplier: usize = 1;
    let mut value: usize = 0;
    let mut header_len = 1;
    for i in 0..4 {
        let Some(&byte) = buf.get(1 + i) else {
            return Ok(None);
        };
        header_len += 1;
        value += (byte as usize & 0b0111_1111) * multiplier;
        if byte & 0b1000_0000 == 0 {
            return Ok(Some((packet_type, value, header_len)));
        }
        multiplier *= 128;
    }
    Err(DecodeError::MalformedLength)
}

/// Accumulates bytes read off a socket and yields complete control packets
/// as they become available, carrying a partial packet's bytes across
/// invocations (§4.1).
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append freshly-read bytes to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet decoded into a packet.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Decode and remove one complete packet from the front of the buffer,
    /// if one is fully present.
    pub fn decode_next(&mut self) -> Result<Option<VariablePacket>, DecodeError> {
        let Some((packet_type, remaining_length, header_len)) =
            try_parse_fixed_header(&self.buf)?
        else {
            return Ok(None);
        };

        let total_len = header_len + remaining_length;
        if self.buf.len() < total_len {
            return Ok(None);
        }

        let frame = &self.buf[..total_len];
        let mut ba = ByteArray::new(frame);
        let packet = decode_one(packet_type, &mut ba)?;
        self.buf.drain(..total_len);
        Ok(Some(packet))
    }
}

fn decode_one(packet_type: PacketType, ba: &mut ByteArray) -> Result<VariablePacket, DecodeError> {
    match packet_type {
        PacketType::Connect => Ok(VariablePacket::Connect(ConnectPacket::decode(ba)?)),
        PacketType::ConnectAck => Ok(VariablePacket::ConnectAck(ConnectAckPacket::decode(ba)?)),
        PacketType::Publish { .. } => Ok(VariablePacket::Publish(PublishPacket::decode(ba)?)),
        PacketType::PublishAck => Ok(VariablePacket::PublishAck(PublishAckPacket::decode(ba)?)),
        PacketType::PublishReceived => Ok(VariablePacket::PublishReceived(
            PublishReceivedPacket::decode(ba)?,
        )),
        PacketType::PublishRelease => Ok(VariablePacket::PublishRelease(
            PublishReleasePacket::decode(ba)?,
        )),
        PacketType::PublishComplete => Ok(VariablePacket::PublishComplete(
            PublishCompletePacket::decode(ba)?,
        )),
        PacketType::Subscribe => Ok(VariablePacket::Subscribe(SubscribePacket::decode(ba)?)),
        PacketType::SubscribeAck => {
            Ok(VariablePacket::SubscribeAck(SubscribeAckPacket::decode(ba)?))
        }
        PacketType::Unsubscribe => Ok(VariablePacket::Unsubscribe(UnsubscribePacket::decode(ba)?)),
        PacketType::UnsubscribeAck => Ok(VariablePacket::UnsubscribeAck(
            UnsubscribeAckPacket::decode(ba)?,
        )),
        PacketType::PingRequest => {
            Ok(VariablePacket::PingRequest(PingRequestPacket::decode(ba)?))
        }
        PacketType::PingResponse => Ok(VariablePacket::PingResponse(
            PingResponsePacket::decode(ba)?,
        )),
        PacketType::Disconnect => Ok(VariablePacket::Disconnect(DisconnectPacket::decode(ba)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::EncodePacket;
    use crate::QoS;

    #[test]
    fn decodes_one_packet_fed_whole() {
        let packet = PingRequestPacket;
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut decoder = Decoder::new();
        decoder.feed(&buf);
        assert_eq!(
            decoder.decode_next().unwrap(),
            Some(VariablePacket::PingRequest(packet))
        );
        assert_eq!(decoder.decode_next().unwrap(), None);
    }

    #[test]
    fn resumes_across_partial_feeds() {
        let packet = PublishPacket::new("a/b", QoS::AtLeastOnce, b"hello")
            .unwrap()
            .with_packet_id(PacketId::new(5));
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut decoder = Decoder::new();
        decoder.feed(&buf[..3]);
        assert_eq!(decoder.decode_next().unwrap(), None);
        decoder.feed(&buf[3..]);
        assert_eq!(
            decoder.decode_next().unwrap(),
            Some(VariablePacket::Publish(packet))
        );
    }

    #[test]
    fn decodes_back_to_back_packets() {
        let a = PingRequestPacket;
        let b = PingResponsePacket;
        let mut buf = Vec::new();
        a.encode(&mut buf).unwrap();
        b.encode(&mut buf).unwrap();

        let mut decoder = Decoder::new();
        decoder.feed(&buf);
        assert_eq!(
            decoder.decode_next().unwrap(),
            Some(VariablePacket::PingRequest(a))
        );
        assert_eq!(
            decoder.decode_next().unwrap(),
            Some(VariablePacket::PingResponse(b))
        );
        assert_eq!(decoder.decode_next().unwrap(), None);
    }
}

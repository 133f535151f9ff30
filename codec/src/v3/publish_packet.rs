// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};

use super::{FixedHeader, Packet, PacketType};
use crate::topic::validate_pub_topic;
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, PacketId, QoS};

/// PUBLISH carries application data from one party to the other; it is the
/// only packet type whose fixed-header flags are significant (dup/qos/retain).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishPacket {
    topic: String,
    qos: QoS,
    packet_id: Option<PacketId>,
    payload: Vec<u8>,
    dup: bool,
    retain: bool,
}

impl PublishPacket {
    pub fn new(topic: &str, qos: QoS, payload: &[u8]) -> Result<Self, EncodeError> {
        validate_pub_topic(topic).map_err(|_| EncodeError::InvalidPacketType)?;
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(PacketId::new(1)),
        };
        Ok(PublishPacket {
            topic: topic.to_string(),
            qos,
            packet_id,
            payload: payload.to_vec(),
            dup: false,
            retain: false,
        })
    }

    pub fn with_packet_id(mut self, packet_id: PacketId) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn packet_id(&self) -> Option<PacketId> {
        self.packet_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn dup(&self) -> bool {
        self.dup
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    /// `true` for a retained-clear publish: `retain=true` with an empty
    /// payload (§3).
    pub fn clears_retained(&self) -> bool {
        self.retain && self.payload.is_empty()
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };
        let qos = QoS::try_from(qos)?;
        // The DUP flag MUST be set to 0 for all QoS 0 messages (MQTT-3.3.1-2).
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::InvalidPacketFlags);
        }

        let start_offset = ba.offset();
        let topic = ba.read_utf8_string()?;
        if topic.is_empty() || topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::InvalidClientId);
        }

        let packet_id = if qos != QoS::AtMostOnce {
            Some(PacketId::decode(ba)?)
        } else {
            None
        };

        let consumed = ba.offset() - start_offset;
        if consumed > fixed_header.remaining_length() {
            return Err(DecodeError::PayloadOverflow);
        }
        let payload_len = fixed_header.remaining_length() - consumed;
        let payload = ba.read_bytes(payload_len)?.to_vec();

        Ok(PublishPacket {
            topic,
            qos,
            packet_id,
            payload,
            dup,
            retain,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let mut remaining_length = 2 + self.topic.len() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            remaining_length += 2;
        }

        let packet_type = PacketType::Publish {
            dup: self.dup,
            qos: self.qos.as_u8(),
            retain: self.retain,
        };
        let fixed_header = FixedHeader::new(packet_type, remaining_length)?;
        fixed_header.encode(buf)?;

        buf.write_u16::<BigEndian>(self.topic.len() as u16)
            .expect("write to Vec<u8> never fails");
        buf.extend_from_slice(self.topic.as_bytes());

        if self.qos != QoS::AtMostOnce {
            let packet_id = self.packet_id.unwrap_or_else(|| PacketId::new(1));
            packet_id.encode(buf)?;
        }

        buf.extend_from_slice(&self.payload);

        Ok(buf.len() - old_len)
    }
}

impl Packet for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish {
            dup: self.dup,
            qos: self.qos.as_u8(),
            retain: self.retain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_qos0() {
        let packet = PublishPacket::new("a/b", QoS::AtMostOnce, b"hello").unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(PublishPacket::decode(&mut ba).unwrap(), packet);
    }

    #[test]
    fn round_trip_qos2_with_dup_and_retain() {
        let packet = PublishPacket::new("a/b", QoS::ExactlyOnce, b"hello")
            .unwrap()
            .with_packet_id(PacketId::new(42))
            .with_retain(true)
            .with_dup(true);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.packet_id(), Some(PacketId::new(42)));
    }

    #[test]
    fn empty_payload_retain_clears() {
        let packet = PublishPacket::new("a/b", QoS::AtMostOnce, b"")
            .unwrap()
            .with_retain(true);
        assert!(packet.clears_retained());
    }

    #[test]
    fn rejects_wildcard_topic() {
        assert!(PublishPacket::new("a/+/b", QoS::AtMostOnce, b"x").is_err());
    }
}

// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};

use super::{FixedHeader, Packet, PacketType};
use crate::topic::validate_sub_topic;
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, PacketId, QoS};

/// Topic filter/QoS pair carried in a SUBSCRIBE payload.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscribeTopic {
    filter: String,
    qos: QoS,
}

impl SubscribeTopic {
    pub fn new(filter: &str, qos: QoS) -> Result<Self, EncodeError> {
        validate_sub_topic(filter).map_err(|_| EncodeError::InvalidPacketType)?;
        Ok(Self {
            filter: filter.to_string(),
            qos,
        })
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    fn bytes(&self) -> usize {
        2 + self.filter.len() + 1
    }
}

impl EncodePacket for SubscribeTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.filter.len() as u16)
            .expect("write to Vec<u8> never fails");
        buf.extend_from_slice(self.filter.as_bytes());
        buf.push(self.qos.as_u8());
        Ok(self.bytes())
    }
}

impl DecodePacket for SubscribeTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let filter = ba.read_utf8_string()?;

        let qos_flag = ba.read_byte()?;
        // The upper 6 bits of the Requested QoS byte are reserved and MUST
        // be zero; the Server MUST treat any non-zero reserved bit or an
        // invalid QoS value as malformed [MQTT-3-8.3-4].
        if qos_flag & 0b1111_1100 != 0b0000_0000 {
            return Err(DecodeError::InvalidQoS);
        }
        let qos = QoS::try_from(qos_flag)?;

        Ok(Self { filter, qos })
    }
}

/// SUBSCRIBE: sent by the client to request delivery from one or more topic
/// filters at up to a given QoS (§4.5).
///
/// A SUBSCRIBE packet with no payload is a protocol violation
/// [MQTT-3.8.3-3].
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribePacket {
    packet_id: PacketId,
    topics: Vec<SubscribeTopic>,
}

impl SubscribePacket {
    pub fn new(packet_id: PacketId, topics: Vec<SubscribeTopic>) -> Result<Self, EncodeError> {
        if topics.is_empty() {
            return Err(EncodeError::InvalidPacketType);
        }
        Ok(SubscribePacket { packet_id, topics })
    }

    pub fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    pub fn topics(&self) -> &[SubscribeTopic] {
        &self.topics
    }
}

impl DecodePacket for SubscribePacket {
    fn decode(ba: &mut ByteArray) -> Result<SubscribePacket, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Subscribe {
            return Err(DecodeError::InvalidPacketType);
        }

        let packet_id = PacketId::decode(ba)?;

        let mut topics = Vec::new();
        let mut consumed = packet_id.bytes();

        while consumed < fixed_header.remaining_length() {
            let start = ba.offset();
            let topic = SubscribeTopic::decode(ba)?;
            consumed += ba.offset() - start;
            topics.push(topic);
        }

        if topics.is_empty() {
            return Err(DecodeError::EmptyTopicFilter);
        }

        Ok(SubscribePacket { packet_id, topics })
    }
}

impl EncodePacket for SubscribePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let mut remaining_length = self.packet_id.bytes();
        for topic in &self.topics {
            remaining_length += topic.bytes();
        }

        let fixed_header = FixedHeader::new(PacketType::Subscribe, remaining_length)?;
        fixed_header.encode(buf)?;

        self.packet_id.encode(buf)?;
        for topic in &self.topics {
            topic.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl Packet for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_multiple_filters() {
        let packet = SubscribePacket::new(
            PacketId::new(3),
            vec![
                SubscribeTopic::new("a/b", QoS::AtMostOnce).unwrap(),
                SubscribeTopic::new("a/#", QoS::ExactlyOnce).unwrap(),
            ],
        )
        .unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(SubscribePacket::decode(&mut ba).unwrap(), packet);
    }

    #[test]
    fn rejects_empty_topic_list() {
        assert!(SubscribePacket::new(PacketId::new(3), vec![]).is_err());
    }

    #[test]
    fn rejects_hash_not_in_terminal_position() {
        assert!(SubscribeTopic::new("a/#/b", QoS::AtMostOnce).is_err());
    }
}

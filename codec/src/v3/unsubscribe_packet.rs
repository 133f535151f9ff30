// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};

use super::{FixedHeader, Packet, PacketType};
use crate::topic::validate_sub_topic;
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, PacketId};

/// UNSUBSCRIBE: sent by the client to remove one or more topic filters
/// (§4.6). Like SUBSCRIBE, an empty filter list is malformed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnsubscribePacket {
    packet_id: PacketId,
    topics: Vec<String>,
}

impl UnsubscribePacket {
    pub fn new(packet_id: PacketId, topics: Vec<String>) -> Result<Self, EncodeError> {
        if topics.is_empty() {
            return Err(EncodeError::InvalidPacketType);
        }
        for topic in &topics {
            validate_sub_topic(topic).map_err(|_| EncodeError::InvalidPacketType)?;
        }
        Ok(Self { packet_id, topics })
    }

    pub fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }
}

impl DecodePacket for UnsubscribePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Unsubscribe {
            return Err(DecodeError::InvalidPacketType);
        }

        let packet_id = PacketId::decode(ba)?;
        let mut topics = Vec::new();
        let mut consumed = packet_id.bytes();

        while consumed < fixed_header.remaining_length() {
            let start = ba.offset();
            let topic = ba.read_utf8_string()?;
            consumed += ba.offset() - start;
            topics.push(topic);
        }

        if topics.is_empty() {
            return Err(DecodeError::EmptyTopicFilter);
        }

        Ok(UnsubscribePacket { packet_id, topics })
    }
}

impl EncodePacket for UnsubscribePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let mut remaining_length = self.packet_id.bytes();
        for topic in &self.topics {
            remaining_length += 2 + topic.len();
        }

        FixedHeader::new(PacketType::Unsubscribe, remaining_length)?.encode(buf)?;
        self.packet_id.encode(buf)?;
        for topic in &self.topics {
            buf.write_u16::<BigEndian>(topic.len() as u16)
                .expect("write to Vec<u8> never fails");
            buf.extend_from_slice(topic.as_bytes());
        }

        Ok(buf.len() - old_len)
    }
}

impl Packet for UnsubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Unsubscribe
    }
}

// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use super::{FixedHeader, Packet, PacketType};
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// PINGRESP: no variable header, no payload.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct PingResponsePacket;

impl DecodePacket for PingResponsePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::PingResponse {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() != 0 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        Ok(PingResponsePacket)
    }
}

impl EncodePacket for PingResponsePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        FixedHeader::new(PacketType::PingResponse, 0)?.encode(buf)?;
        Ok(buf.len() - old_len)
    }
}

impl Packet for PingResponsePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::PingResponse
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut buf = Vec::new();
        PingResponsePacket.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PingResponsePacket::decode(&mut ba).unwrap(),
            PingResponsePacket
        );
    }
}

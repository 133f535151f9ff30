// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use super::{FixedHeader, Packet, PacketType};
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// MQTT 3.1.1 §3.2.2.3 connect return codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
}

impl ConnectReturnCode {
    fn to_byte(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUsernameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUsernameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            _ => Err(DecodeError::InvalidPacketType),
        }
    }
}

/// CONNACK, sent by the server in reply to CONNECT.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectAckPacket {
    session_present: bool,
    return_code: ConnectReturnCode,
}

impl ConnectAckPacket {
    pub fn new(return_code: ConnectReturnCode, session_present: bool) -> Self {
        // Session Present MUST be 0 unless the return code is Accepted
        // (MQTT-3.2.2-4).
        let session_present = session_present && matches!(return_code, ConnectReturnCode::Accepted);
        Self {
            session_present,
            return_code,
        }
    }

    pub fn session_present(&self) -> bool {
        self.session_present
    }

    pub fn return_code(&self) -> ConnectReturnCode {
        self.return_code
    }
}

impl DecodePacket for ConnectAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::ConnectAck {
            return Err(DecodeError::InvalidPacketType);
        }
        let flags = ba.read_byte()?;
        if flags & 0b1111_1110 != 0 {
            return Err(DecodeError::InvalidConnectFlags);
        }
        let session_present = flags & 0b0000_0001 != 0;
        let return_code = ConnectReturnCode::from_byte(ba.read_byte()?)?;
        Ok(ConnectAckPacket::new(return_code, session_present))
    }
}

impl EncodePacket for ConnectAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let fixed_header = FixedHeader::new(PacketType::ConnectAck, 2)?;
        fixed_header.encode(buf)?;
        buf.push(u8::from(self.session_present));
        buf.push(self.return_code.to_byte());
        Ok(buf.len() - old_len)
    }
}

impl Packet for ConnectAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnectAck
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let packet = ConnectAckPacket::new(ConnectReturnCode::Accepted, true);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(ConnectAckPacket::decode(&mut ba).unwrap(), packet);
    }

    #[test]
    fn session_present_cleared_on_rejection() {
        let packet = ConnectAckPacket::new(ConnectReturnCode::IdentifierRejected, true);
        assert!(!packet.session_present());
    }
}

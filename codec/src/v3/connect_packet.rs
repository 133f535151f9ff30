// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use byteorder::{BigEndian, WriteBytesExt};

use super::{FixedHeader, Packet, PacketType};
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, QoS};

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

/// CONNECT's `Connect Flags` byte, MQTT 3.1.1 §3.1.2.3.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectFlags {
    pub clean_session: bool,
    pub will_flag: bool,
    pub will_qos: QoS,
    pub will_retain: bool,
    pub password_flag: bool,
    pub username_flag: bool,
}

impl ConnectFlags {
    fn to_byte(self) -> u8 {
        (u8::from(self.username_flag) << 7)
            | (u8::from(self.password_flag) << 6)
            | (u8::from(self.will_retain) << 5)
            | (self.will_qos.as_u8() << 3)
            | (u8::from(self.will_flag) << 2)
            | (u8::from(self.clean_session) << 1)
    }

    fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        if byte & 0b0000_0001 != 0 {
            // The reserved low bit MUST be zero (MQTT-3.1.2-3).
            return Err(DecodeError::InvalidConnectFlags);
        }
        let will_flag = byte & 0b0000_0100 != 0;
        let will_qos = QoS::try_from((byte & 0b0001_1000) >> 3)?;
        if !will_flag && will_qos != QoS::AtMostOnce {
            return Err(DecodeError::InvalidConnectFlags);
        }
        Ok(ConnectFlags {
            clean_session: byte & 0b0000_0010 != 0,
            will_flag,
            will_qos,
            will_retain: byte & 0b0010_0000 != 0,
            password_flag: byte & 0b0100_0000 != 0,
            username_flag: byte & 0b1000_0000 != 0,
        })
    }
}

/// A last-will announced on CONNECT, published by the broker on abnormal
/// disconnect (§4.4).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNECT is the first packet sent on a new network connection; it is
/// always decoded while the dispatcher is in `AwaitingConnect`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectPacket {
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl ConnectPacket {
    pub fn new(client_id: &str, clean_session: bool, keep_alive: u16) -> Self {
        ConnectPacket {
            protocol_level: PROTOCOL_LEVEL,
            clean_session,
            keep_alive,
            client_id: client_id.to_string(),
            will: None,
            username: None,
            password: None,
        }
    }

    pub fn with_will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &[u8]) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_vec());
        self
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name = ba.read_utf8_string()?;
        if protocol_name != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }

        // The protocol level is not validated here: an unsupported level is
        // answered with CONNACK(UnacceptableProtocolVersion) rather than a
        // closed connection, which is a dispatcher-level decision.
        let protocol_level = ba.read_byte()?;

        let flags_byte = ba.read_byte()?;
        let flags = ConnectFlags::from_byte(flags_byte)?;

        let keep_alive = ba.read_u16()?;
        let client_id = ba.read_utf8_string()?;

        let will = if flags.will_flag {
            let topic = ba.read_utf8_string()?;
            let len = ba.read_u16()? as usize;
            let message = ba.read_bytes(len)?.to_vec();
            Some(LastWill {
                topic,
                message,
                qos: flags.will_qos,
                retain: flags.will_retain,
            })
        } else {
            None
        };

        let username = if flags.username_flag {
            Some(ba.read_utf8_string()?)
        } else {
            None
        };

        let password = if flags.password_flag {
            let len = ba.read_u16()? as usize;
            Some(ba.read_bytes(len)?.to_vec())
        } else {
            None
        };

        Ok(ConnectPacket {
            protocol_level,
            clean_session: flags.clean_session,
            keep_alive,
            client_id,
            will,
            username,
            password,
        })
    }
}

fn write_utf8_string(buf: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    if s.len() > u16::MAX as usize {
        return Err(EncodeError::TooManyData);
    }
    buf.write_u16::<BigEndian>(s.len() as u16)
        .expect("write to Vec<u8> never fails");
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > u16::MAX as usize {
        return Err(EncodeError::TooManyData);
    }
    buf.write_u16::<BigEndian>(data.len() as u16)
        .expect("write to Vec<u8> never fails");
    buf.extend_from_slice(data);
    Ok(())
}

fn utf8_string_bytes(s: &str) -> usize {
    2 + s.len()
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let mut remaining_length = utf8_string_bytes(PROTOCOL_NAME) + 1 + 1 + 2;
        remaining_length += utf8_string_bytes(&self.client_id);
        if let Some(will) = &self.will {
            remaining_length += utf8_string_bytes(&will.topic);
            remaining_length += 2 + will.message.len();
        }
        if let Some(username) = &self.username {
            remaining_length += utf8_string_bytes(username);
        }
        if let Some(password) = &self.password {
            remaining_length += 2 + password.len();
        }

        let fixed_header = FixedHeader::new(PacketType::Connect, remaining_length)?;
        fixed_header.encode(buf)?;

        write_utf8_string(buf, PROTOCOL_NAME)?;
        buf.push(self.protocol_level);

        let flags = ConnectFlags {
            clean_session: self.clean_session,
            will_flag: self.will.is_some(),
            will_qos: self.will.as_ref().map(|w| w.qos).unwrap_or_default(),
            will_retain: self.will.as_ref().map(|w| w.retain).unwrap_or(false),
            password_flag: self.password.is_some(),
            username_flag: self.username.is_some(),
        };
        buf.push(flags.to_byte());

        buf.write_u16::<BigEndian>(self.keep_alive)
            .expect("write to Vec<u8> never fails");
        write_utf8_string(buf, &self.client_id)?;

        if let Some(will) = &self.will {
            write_utf8_string(buf, &will.topic)?;
            write_bytes(buf, &will.message)?;
        }
        if let Some(username) = &self.username {
            write_utf8_string(buf, username)?;
        }
        if let Some(password) = &self.password {
            write_bytes(buf, password)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl Packet for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_without_will() {
        let packet = ConnectPacket::new("client-1", true, 30);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn round_trip_with_will_and_credentials() {
        let packet = ConnectPacket::new("client-2", false, 60)
            .with_will(LastWill {
                topic: "clients/client-2/status".to_string(),
                message: b"offline".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: true,
            })
            .with_credentials("alice", b"secret");
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn rejects_bad_protocol_name() {
        let mut buf = Vec::new();
        FixedHeader::new(PacketType::Connect, 14).unwrap().encode(&mut buf).unwrap();
        write_utf8_string(&mut buf, "MQIsdp").unwrap();
        buf.extend_from_slice(&[4, 0, 0, 0, 0, 0]);
        let mut ba = ByteArray::new(&buf);
        assert_eq!(ConnectPacket::decode(&mut ba), Err(DecodeError::InvalidProtocolName));
    }
}

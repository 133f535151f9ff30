// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::DecodeError;

/// The 14 control packet types defined by MQTT 3.1.1 §2.2.1.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PacketType {
    Connect,
    ConnectAck,
    Publish { dup: bool, qos: u8, retain: bool },
    PublishAck,
    PublishReceived,
    PublishRelease,
    PublishComplete,
    Subscribe,
    SubscribeAck,
    Unsubscribe,
    UnsubscribeAck,
    PingRequest,
    PingResponse,
    Disconnect,
}

impl PacketType {
    /// The 4-bit type code in the fixed header's high nibble.
    pub const fn type_code(&self) -> u8 {
        match self {
            PacketType::Connect => 1,
            PacketType::ConnectAck => 2,
            PacketType::Publish { .. } => 3,
            PacketType::PublishAck => 4,
            PacketType::PublishReceived => 5,
            PacketType::PublishRelease => 6,
            PacketType::PublishComplete => 7,
            PacketType::Subscribe => 8,
            PacketType::SubscribeAck => 9,
            PacketType::Unsubscribe => 10,
            PacketType::UnsubscribeAck => 11,
            PacketType::PingRequest => 12,
            PacketType::PingResponse => 13,
            PacketType::Disconnect => 14,
        }
    }

    /// The fixed-header flags byte (low nibble), which for most packet
    /// types is a reserved constant and for PUBLISH carries dup/qos/retain.
    pub fn flags_byte(&self) -> u8 {
        match *self {
            PacketType::Publish { dup, qos, retain } => {
                (u8::from(dup) << 3) | ((qos & 0b11) << 1) | u8::from(retain)
            }
            PacketType::Subscribe
            | PacketType::Unsubscribe
            | PacketType::PublishRelease => 0b0010,
            _ => 0b0000,
        }
    }

    pub fn from_byte(byte: u8) -> Result<PacketType, DecodeError> {
        let type_code = (byte & 0b1111_0000) >> 4;
        let flags = byte & 0b0000_1111;
        match type_code {
            1 => {
                check_reserved_flags(flags, 0b0000)?;
                Ok(PacketType::Connect)
            }
            2 => {
                check_reserved_flags(flags, 0b0000)?;
                Ok(PacketType::ConnectAck)
            }
            3 => Ok(PacketType::Publish {
                dup: flags & 0b1000 != 0,
                qos: (flags & 0b0110) >> 1,
                retain: flags & 0b0001 != 0,
            }),
            4 => {
                check_reserved_flags(flags, 0b0000)?;
                Ok(PacketType::PublishAck)
            }
            5 => {
                check_reserved_flags(flags, 0b0000)?;
                Ok(PacketType::PublishReceived)
            }
            6 => {
                check_reserved_flags(flags, 0b0010)?;
                Ok(PacketType::PublishRelease)
            }
            7 => {
                check_reserved_flags(flags, 0b0000)?;
                Ok(PacketType::PublishComplete)
            }
            8 => {
                check_reserved_flags(flags, 0b0010)?;
                Ok(PacketType::Subscribe)
            }
            9 => {
                check_reserved_flags(flags, 0b0000)?;
                Ok(PacketType::SubscribeAck)
            }
            10 => {
                check_reserved_flags(flags, 0b0010)?;
                Ok(PacketType::Unsubscribe)
            }
            11 => {
                check_reserved_flags(flags, 0b0000)?;
                Ok(PacketType::UnsubscribeAck)
            }
            12 => {
                check_reserved_flags(flags, 0b0000)?;
                Ok(PacketType::PingRequest)
            }
            13 => {
                check_reserved_flags(flags, 0b0000)?;
                Ok(PacketType::PingResponse)
            }
            14 => {
                check_reserved_flags(flags, 0b0000)?;
                Ok(PacketType::Disconnect)
            }
            _ => Err(DecodeError::UnknownType),
        }
    }
}

fn check_reserved_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags == expected {
        Ok(())
    } else {
        Err(DecodeError::ReservedFlagsViolated)
    }
}

/// Bare packet-type discriminant without PUBLISH's embedded flags, used
/// where callers only care "which handler do I dispatch to".
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Connect = 1,
    ConnectAck = 2,
    Publish = 3,
    PublishAck = 4,
    PublishReceived = 5,
    PublishRelease = 6,
    PublishComplete = 7,
    Subscribe = 8,
    SubscribeAck = 9,
    Unsubscribe = 10,
    UnsubscribeAck = 11,
    PingRequest = 12,
    PingResponse = 13,
    Disconnect = 14,
}

impl From<&PacketType> for PacketKind {
    fn from(t: &PacketType) -> Self {
        match t {
            PacketType::Connect => PacketKind::Connect,
            PacketType::ConnectAck => PacketKind::ConnectAck,
            PacketType::Publish { .. } => PacketKind::Publish,
            PacketType::PublishAck => PacketKind::PublishAck,
            PacketType::PublishReceived => PacketKind::PublishReceived,
            PacketType::PublishRelease => PacketKind::PublishRelease,
            PacketType::PublishComplete => PacketKind::PublishComplete,
            PacketType::Subscribe => PacketKind::Subscribe,
            PacketType::SubscribeAck => PacketKind::SubscribeAck,
            PacketType::Unsubscribe => PacketKind::Unsubscribe,
            PacketType::UnsubscribeAck => PacketKind::UnsubscribeAck,
            PacketType::PingRequest => PacketKind::PingRequest,
            PacketType::PingResponse => PacketKind::PingResponse,
            PacketType::Disconnect => PacketKind::Disconnect,
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::Connect),
            2 => Ok(PacketKind::ConnectAck),
            3 => Ok(PacketKind::Publish),
            4 => Ok(PacketKind::PublishAck),
            5 => Ok(PacketKind::PublishReceived),
            6 => Ok(PacketKind::PublishRelease),
            7 => Ok(PacketKind::PublishComplete),
            8 => Ok(PacketKind::Subscribe),
            9 => Ok(PacketKind::SubscribeAck),
            10 => Ok(PacketKind::Unsubscribe),
            11 => Ok(PacketKind::UnsubscribeAck),
            12 => Ok(PacketKind::PingRequest),
            13 => Ok(PacketKind::PingResponse),
            14 => Ok(PacketKind::Disconnect),
            _ => Err(DecodeError::UnknownType),
        }
    }
}

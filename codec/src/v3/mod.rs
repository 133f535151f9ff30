// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! MQTT 3.1.1 control packet types.

mod connect_ack_packet;
mod connect_packet;
mod disconnect_packet;
mod ping_request_packet;
mod ping_response_packet;
mod publish_ack_packet;
mod publish_complete_packet;
mod publish_packet;
mod publish_received_packet;
mod publish_release_packet;
mod subscribe_ack_packet;
mod subscribe_packet;
mod unsubscribe_ack_packet;
mod unsubscribe_packet;

pub use connect_ack_packet::{ConnectAckPacket, ConnectReturnCode};
pub use connect_packet::{ConnectFlags, ConnectPacket, LastWill};
pub use disconnect_packet::DisconnectPacket;
pub use ping_request_packet::PingRequestPacket;
pub use ping_response_packet::PingResponsePacket;
pub use publish_ack_packet::PublishAckPacket;
pub use publish_complete_packet::PublishCompletePacket;
pub use publish_packet::PublishPacket;
pub use publish_received_packet::PublishReceivedPacket;
pub use publish_release_packet::PublishReleasePacket;
pub use subscribe_ack_packet::{SubscribeAckPacket, SubscribeAckReason};
pub use subscribe_packet::{SubscribePacket, SubscribeTopic};
pub use unsubscribe_ack_packet::UnsubscribeAckPacket;
pub use unsubscribe_packet::UnsubscribePacket;

pub(crate) use crate::fixed_header::FixedHeader;
pub(crate) use crate::packet_type::PacketType;
pub(crate) use crate::traits::Packet;

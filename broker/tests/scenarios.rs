// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! End-to-end scenarios driving two independent connections against one
//! running broker, over in-memory duplex transports.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use broker::broker::Broker;
use broker::commands::BrokerHandle;
use broker::config;
use broker::dispatcher::Dispatcher;

use codec::v3::{ConnectAckPacket, ConnectPacket, ConnectReturnCode, PublishAckPacket, PublishPacket, SubscribeAckPacket, SubscribePacket, SubscribeTopic};
use codec::{ByteArray, DecodePacket, EncodePacket, PacketId, QoS};

async fn spawn_broker() -> BrokerHandle {
    let broker = Broker::new(&config::Session::default());
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(broker.run(rx));
    tx
}

fn connection(broker: BrokerHandle) -> (tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>) {
    let (client, server) = tokio::io::duplex(8192);
    let dispatcher = Dispatcher::new(server, broker, config::Session::default());
    tokio::spawn(dispatcher.serve());
    tokio::io::split(client)
}

async fn send<P: EncodePacket>(write_half: &mut tokio::io::WriteHalf<tokio::io::DuplexStream>, packet: &P) {
    let mut buf = Vec::new();
    packet.encode(&mut buf).unwrap();
    write_half.write_all(&buf).await.unwrap();
}

async fn recv_bytes(read_half: &mut tokio::io::ReadHalf<tokio::io::DuplexStream>) -> Vec<u8> {
    let mut buf = vec![0u8; 256];
    let n = read_half.read(&mut buf).await.unwrap();
    buf.truncate(n);
    buf
}

async fn connect_and_expect_accepted(
    read_half: &mut tokio::io::ReadHalf<tokio::io::DuplexStream>,
    write_half: &mut tokio::io::WriteHalf<tokio::io::DuplexStream>,
    client_id: &str,
    clean_session: bool,
) {
    send(write_half, &ConnectPacket::new(client_id, clean_session, 60)).await;
    let bytes = recv_bytes(read_half).await;
    let mut ba = ByteArray::new(&bytes);
    let ack = ConnectAckPacket::decode(&mut ba).unwrap();
    assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);
}

/// Scenario: a publisher retains a message before any subscriber exists; a
/// later subscriber on a matching wildcard filter receives it immediately.
#[tokio::test]
async fn retained_replay_across_connections() {
    let broker = spawn_broker().await;

    let (mut pub_read, mut pub_write) = connection(broker.clone());
    connect_and_expect_accepted(&mut pub_read, &mut pub_write, "publisher", true).await;

    let publish = PublishPacket::new("room/temp", QoS::AtMostOnce, b"22")
        .unwrap()
        .with_retain(true);
    send(&mut pub_write, &publish).await;

    let (mut sub_read, mut sub_write) = connection(broker.clone());
    connect_and_expect_accepted(&mut sub_read, &mut sub_write, "subscriber", true).await;

    let subscribe = SubscribePacket::new(
        PacketId::new(1),
        vec![SubscribeTopic::new("room/#", QoS::AtMostOnce).unwrap()],
    )
    .unwrap();
    send(&mut sub_write, &subscribe).await;

    let bytes = recv_bytes(&mut sub_read).await;
    let mut ba = ByteArray::new(&bytes);
    let _ack = SubscribeAckPacket::decode(&mut ba).unwrap();

    let bytes = recv_bytes(&mut sub_read).await;
    let mut ba = ByteArray::new(&bytes);
    let received = PublishPacket::decode(&mut ba).unwrap();
    assert_eq!(received.topic(), "room/temp");
    assert_eq!(received.payload(), b"22");
    assert!(received.retain());
}

/// Scenario: a client reconnects with `clean_session = true`, which must
/// drop its prior subscriptions; messages published on the old filter
/// after reconnect must not reach it.
#[tokio::test]
async fn clean_reconnect_drops_prior_subscriptions() {
    let broker = spawn_broker().await;

    let (mut read_half, mut write_half) = connection(broker.clone());
    connect_and_expect_accepted(&mut read_half, &mut write_half, "watcher", false).await;

    let subscribe = SubscribePacket::new(
        PacketId::new(1),
        vec![SubscribeTopic::new("a/b", QoS::AtMostOnce).unwrap()],
    )
    .unwrap();
    send(&mut write_half, &subscribe).await;
    let _ack_bytes = recv_bytes(&mut read_half).await;

    send(&mut write_half, &codec::v3::DisconnectPacket).await;
    drop(write_half);
    drop(read_half);

    // Give the broker a moment to process the abnormal disconnect.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let (mut read_half2, mut write_half2) = connection(broker.clone());
    connect_and_expect_accepted(&mut read_half2, &mut write_half2, "watcher", true).await;

    let (mut pub_read, mut pub_write) = connection(broker.clone());
    connect_and_expect_accepted(&mut pub_read, &mut pub_write, "publisher", true).await;
    let publish = PublishPacket::new("a/b", QoS::AtMostOnce, b"live").unwrap();
    send(&mut pub_write, &publish).await;

    // Nothing further should arrive on the reconnected, clean session.
    let mut buf = vec![0u8; 16];
    let result = tokio::time::timeout(std::time::Duration::from_millis(100), read_half2.read(&mut buf)).await;
    assert!(result.is_err(), "expected no message on the old filter after a clean reconnect");
}

/// Scenario: a QoS 1 publish acknowledges with PUBACK carrying the same
/// packet id, end to end through the broker.
#[tokio::test]
async fn qos1_publish_is_acknowledged() {
    let broker = spawn_broker().await;
    let (mut read_half, mut write_half) = connection(broker);
    connect_and_expect_accepted(&mut read_half, &mut write_half, "client", true).await;

    let publish = PublishPacket::new("t", QoS::AtLeastOnce, b"hi")
        .unwrap()
        .with_packet_id(PacketId::new(9));
    send(&mut write_half, &publish).await;

    let bytes = recv_bytes(&mut read_half).await;
    let mut ba = ByteArray::new(&bytes);
    let ack = PublishAckPacket::decode(&mut ba).unwrap();
    assert_eq!(ack.packet_id(), PacketId::new(9));
}

// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Client-role dispatcher driving one session against a remote broker
//! (§4.8). Reuses `codec` for framing and `mapping` for translation;
//! it is the mirror image of `broker::dispatcher::Dispatcher`, speaking the
//! client rather than the server half of each exchange.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::interval;

use codec::v3::{ConnectAckPacket, ConnectPacket, ConnectReturnCode, LastWill, PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket, PublishReleasePacket, SubscribePacket, SubscribeTopic};
use codec::{Decoder, EncodePacket, PacketId, PacketIdAllocator, QoS, VariablePacket};
use mapping::{ConnectionConfig, MappingDocument};

use crate::error::{Error, ErrorKind};

const CFG_CONNECTION_TOPIC: &str = "snode.c/_cfg_/connection";
const CFG_MAPPING_TOPIC: &str = "snode.c/_cfg_/mapping";

/// One connected session against a remote broker, following the mapping
/// document's `connection` parameters and subscription set.
pub struct Client<S> {
    stream: S,
    decoder: Decoder,
    document: MappingDocument,
    raw_document: String,
    packet_ids: PacketIdAllocator,
    outbound_inflight: std::collections::HashSet<PacketId>,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, document: MappingDocument, raw_document: String) -> Self {
        Client {
            stream,
            decoder: Decoder::new(),
            document,
            raw_document,
            packet_ids: PacketIdAllocator::new(),
            outbound_inflight: std::collections::HashSet::new(),
        }
    }

    fn connection(&self) -> ConnectionConfig {
        self.document.connection.clone().unwrap_or(ConnectionConfig {
            keep_alive: 60,
            client_id: "mqtt-integrator".to_string(),
            clean_session: true,
            will_topic: None,
            will_message: None,
            will_qos: 0,
            will_retain: false,
            username: None,
            password: None,
        })
    }

    /// Run the session to completion: CONNECT, well-known retained
    /// publications, subscribe to every extracted filter, then loop
    /// translating inbound publishes and sending keep-alive pings until
    /// the transport closes.
    pub async fn run(mut self) -> Result<(), Error> {
        self.send_connect().await?;
        self.await_connack().await?;
        self.announce_config().await?;
        self.subscribe_all().await?;

        let connection = self.connection();
        let keep_alive = Duration::from_secs(connection.keep_alive.max(1) as u64);
        let mut ping_tick = interval(keep_alive);
        ping_tick.tick().await;

        let mut read_buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                n = self.stream.read(&mut read_buf) => {
                    let n = n?;
                    if n == 0 {
                        return Err(Error::new(ErrorKind::Io, "transport closed"));
                    }
                    self.decoder.feed(&read_buf[..n]);
                    self.drain_decoder().await?;
                }
                _ = ping_tick.tick() => {
                    self.write_packet(&codec::v3::PingRequestPacket).await?;
                }
            }
        }
    }

    async fn send_connect(&mut self) -> Result<(), Error> {
        let connection = self.connection();
        let mut connect = ConnectPacket::new(&connection.client_id, connection.clean_session, connection.keep_alive);
        if let (Some(topic), Some(message)) = (&connection.will_topic, &connection.will_message) {
            let qos = QoS::try_from(connection.will_qos.min(2)).unwrap_or(QoS::AtMostOnce);
            connect = connect.with_will(LastWill {
                topic: topic.clone(),
                message: message.clone().into_bytes(),
                qos,
                retain: connection.will_retain,
            });
        }
        if let (Some(username), Some(password)) = (&connection.username, &connection.password) {
            connect = connect.with_credentials(username, password.as_bytes());
        }
        self.write_packet(&connect).await
    }

    async fn await_connack(&mut self) -> Result<(), Error> {
        loop {
            let mut buf = vec![0u8; 256];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::new(ErrorKind::Io, "transport closed before CONNACK"));
            }
            self.decoder.feed(&buf[..n]);
            while let Some(packet) = self.decoder.decode_next()? {
                if let VariablePacket::ConnectAck(ack) = packet {
                    return if ack.return_code() == ConnectReturnCode::Accepted {
                        Ok(())
                    } else {
                        Err(Error::new(ErrorKind::Protocol, "broker rejected CONNECT"))
                    };
                }
                log::warn!("integrator: unexpected packet before CONNACK, ignoring");
            }
        }
    }

    /// Publish the connection and mapping documents as retained messages,
    /// per §4.8 step 2.
    async fn announce_config(&mut self) -> Result<(), Error> {
        let connection_json = serde_json::to_string(&self.connection())
            .map_err(|err| Error::from_string(ErrorKind::Mapping, err.to_string()))?;
        let connect_publish = PublishPacket::new(CFG_CONNECTION_TOPIC, QoS::AtMostOnce, connection_json.as_bytes())?
            .with_retain(true);
        self.write_packet(&connect_publish).await?;

        let mapping_publish = PublishPacket::new(CFG_MAPPING_TOPIC, QoS::AtMostOnce, self.raw_document.as_bytes())?
            .with_retain(true);
        self.write_packet(&mapping_publish).await
    }

    async fn subscribe_all(&mut self) -> Result<(), Error> {
        let subscriptions = self.document.extract_subscriptions();
        if subscriptions.is_empty() {
            return Ok(());
        }
        let topics = subscriptions
            .into_iter()
            .filter_map(|(filter, qos)| {
                let qos = QoS::try_from(qos.min(2)).ok()?;
                SubscribeTopic::new(&filter, qos).ok()
            })
            .collect::<Vec<_>>();
        let packet_id = self.packet_ids.allocate(&self.outbound_inflight);
        let subscribe = SubscribePacket::new(packet_id, topics)?;
        self.write_packet(&subscribe).await
    }

    async fn drain_decoder(&mut self) -> Result<(), Error> {
        while let Some(packet) = self.decoder.decode_next()? {
            self.handle_packet(packet).await?;
        }
        Ok(())
    }

    async fn handle_packet(&mut self, packet: VariablePacket) -> Result<(), Error> {
        match packet {
            VariablePacket::Publish(publish) => self.on_publish(publish).await,
            VariablePacket::PublishAck(ack) => {
                self.outbound_inflight.remove(&ack.packet_id());
                Ok(())
            }
            VariablePacket::PublishReceived(received) => {
                self.write_packet(&PublishReleasePacket::new(received.packet_id())).await
            }
            VariablePacket::PublishRelease(release) => {
                self.write_packet(&PublishCompletePacket::new(release.packet_id())).await
            }
            VariablePacket::PublishComplete(complete) => {
                self.outbound_inflight.remove(&complete.packet_id());
                Ok(())
            }
            VariablePacket::PingResponse(_) => Ok(()),
            VariablePacket::SubscribeAck(_) => Ok(()),
            _ => {
                log::debug!("integrator: ignoring unexpected packet from broker");
                Ok(())
            }
        }
    }

    /// Run the inbound publish through the mapping document and send each
    /// derived publish on; never translated a second time (§4.7).
    /// Acknowledges the inbound publish itself per its own QoS.
    async fn on_publish(&mut self, publish: PublishPacket) -> Result<(), Error> {
        match (publish.qos(), publish.packet_id()) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.write_packet(&PublishAckPacket::new(packet_id)).await?;
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                self.write_packet(&PublishReceivedPacket::new(packet_id)).await?;
            }
            _ => {}
        }

        let derived = self.document.translate(publish.topic(), publish.payload(), publish.qos() as u8);
        for message in derived {
            let qos = QoS::try_from(message.qos.min(2)).unwrap_or(QoS::AtMostOnce);
            let mut outbound = PublishPacket::new(&message.topic, qos, message.payload.as_bytes())?
                .with_retain(message.retain);
            if qos != QoS::AtMostOnce {
                let packet_id = self.packet_ids.allocate(&self.outbound_inflight);
                outbound = outbound.with_packet_id(packet_id);
                self.outbound_inflight.insert(packet_id);
            }
            self.write_packet(&outbound).await?;
        }
        Ok(())
    }

    async fn write_packet<P: EncodePacket>(&mut self, packet: &P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.stream.write_all(&buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> (MappingDocument, String) {
        let raw = serde_json::json!({
            "connection": {
                "client_id": "integrator-1",
                "keep_alive": 30
            },
            "mappings": {
                "name": "button1",
                "subscription": {
                    "qos": 0,
                    "static": {
                        "mapped_topic": "device/button1/set",
                        "retain_message": false,
                        "message_mapping": [{"message": "pressed", "mapped_message": "on"}]
                    }
                }
            }
        })
        .to_string();
        (MappingDocument::parse_str(&raw).unwrap(), raw)
    }

    #[tokio::test]
    async fn connect_announces_config_and_subscribes() {
        let (doc, raw) = document();
        let (client_end, mut broker_end) = tokio::io::duplex(8192);
        let client = Client::new(client_end, doc, raw);
        let handle = tokio::spawn(client.run());

        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; 4096];

        // CONNECT
        let n = broker_end.read(&mut buf).await.unwrap();
        decoder.feed(&buf[..n]);
        let packet = decoder.decode_next().unwrap().unwrap();
        assert!(matches!(packet, VariablePacket::Connect(_)));

        let ack = ConnectAckPacket::new(ConnectReturnCode::Accepted, false);
        let mut out = Vec::new();
        ack.encode(&mut out).unwrap();
        broker_end.write_all(&out).await.unwrap();

        // connection + mapping retained publishes, then SUBSCRIBE
        let mut seen_subscribe = false;
        for _ in 0..4 {
            let n = broker_end.read(&mut buf).await.unwrap();
            decoder.feed(&buf[..n]);
            while let Some(packet) = decoder.decode_next().unwrap() {
                if matches!(packet, VariablePacket::Subscribe(_)) {
                    seen_subscribe = true;
                }
            }
            if seen_subscribe {
                break;
            }
        }
        assert!(seen_subscribe);
        handle.abort();
    }

    #[tokio::test]
    async fn connection_defaults_when_document_omits_it() {
        let doc = MappingDocument::parse_str("{}").unwrap();
        let (client_end, _server_end) = tokio::io::duplex(64);
        let client = Client::new(client_end, doc, "{}".to_string());
        let connection = client.connection();
        assert_eq!(connection.client_id, "mqtt-integrator");
        assert!(connection.clean_session);
    }
}

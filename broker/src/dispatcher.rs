// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Per-connection protocol state machine (§4.5): `AwaitingConnect ->
//! Connected -> Disconnecting`. Owns the framing decoder, the outbound
//! packet-id allocator and in-flight tracking for one session's dispatcher
//! binding. Transport-agnostic: any `AsyncRead + AsyncWrite` stream works,
//! so the same code drives a plain `TcpStream` or an in-memory duplex pair
//! in tests.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

use codec::v3::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, PublishAckPacket, PublishCompletePacket,
    PublishPacket, PublishReceivedPacket, PublishReleasePacket, SubscribeAckPacket,
    SubscribeAckReason, SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};
use codec::{Decoder, EncodePacket, PacketId, PacketIdAllocator, QoS, VariablePacket};

use crate::commands::{BrokerHandle, BrokerToDispatcherCmd, DispatcherHandle, DispatcherToBrokerCmd};
use crate::config;
use crate::error::{Error, ErrorKind};
use crate::session::{OpenOutcome, WillMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingConnect,
    Connected,
    Disconnecting,
}

pub struct Dispatcher<S> {
    stream: S,
    decoder: Decoder,
    broker: BrokerHandle,
    client_id: String,
    clean_session: bool,
    state: State,
    session_config: config::Session,
    packet_ids: PacketIdAllocator,
    outbound_inflight: HashSet<PacketId>,
    pub_recv_pending: HashSet<PacketId>,
    keep_alive: Duration,
    self_tx: DispatcherHandle,
    self_rx: mpsc::Receiver<BrokerToDispatcherCmd>,
}

impl<S> Dispatcher<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, broker: BrokerHandle, session_config: config::Session) -> Self {
        let (self_tx, self_rx) = mpsc::channel(64);
        Dispatcher {
            stream,
            decoder: Decoder::new(),
            broker,
            client_id: String::new(),
            clean_session: true,
            state: State::AwaitingConnect,
            session_config,
            packet_ids: PacketIdAllocator::new(),
            outbound_inflight: HashSet::new(),
            pub_recv_pending: HashSet::new(),
            keep_alive: Duration::from_secs(90),
            self_tx,
            self_rx,
        }
    }

    /// Drive this connection until it closes, normally or abnormally.
    pub async fn serve(mut self) -> Result<(), Error> {
        let mut read_buf = [0u8; 4096];
        let mut watchdog = interval(Duration::from_secs(1));
        let mut last_activity = Instant::now();

        loop {
            if self.state == State::Disconnecting {
                return Ok(());
            }

            tokio::select! {
                read = self.stream.read(&mut read_buf) => {
                    match read {
                        Ok(0) => {
                            self.on_abnormal_disconnect().await;
                            return Ok(());
                        }
                        Ok(n) => {
                            last_activity = Instant::now();
                            self.decoder.feed(&read_buf[..n]);
                            if let Err(err) = self.drain_decoder().await {
                                self.on_abnormal_disconnect().await;
                                return Err(err);
                            }
                        }
                        Err(err) => {
                            self.on_abnormal_disconnect().await;
                            return Err(err.into());
                        }
                    }
                }
                cmd = self.self_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_broker_cmd(cmd).await?,
                        None => return Ok(()),
                    }
                }
                _ = watchdog.tick() => {
                    if self.state == State::Connected && last_activity.elapsed() > self.keep_alive {
                        log::warn!("client {}: keep-alive expired", self.client_id);
                        self.on_abnormal_disconnect().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn drain_decoder(&mut self) -> Result<(), Error> {
        loop {
            match self.decoder.decode_next() {
                Ok(None) => return Ok(()),
                Ok(Some(packet)) => self.handle_packet(packet).await?,
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn handle_packet(&mut self, packet: VariablePacket) -> Result<(), Error> {
        match self.state {
            State::AwaitingConnect => match packet {
                VariablePacket::Connect(connect) => self.on_connect(connect).await,
                _ => Err(Error::new(ErrorKind::Protocol, "packet received before CONNECT")),
            },
            State::Connected => self.on_connected_packet(packet).await,
            State::Disconnecting => Ok(()),
        }
    }

    async fn on_connect(&mut self, connect: ConnectPacket) -> Result<(), Error> {
        if connect.protocol_level != 4 {
            self.write_packet(&ConnectAckPacket::new(ConnectReturnCode::UnacceptableProtocolVersion, false))
                .await?;
            self.state = State::Disconnecting;
            return Ok(());
        }
        if connect.client_id.is_empty() {
            self.write_packet(&ConnectAckPacket::new(ConnectReturnCode::IdentifierRejected, false))
                .await?;
            self.state = State::Disconnecting;
            return Ok(());
        }

        self.client_id = connect.client_id.clone();
        self.clean_session = connect.clean_session;
        self.keep_alive = self.session_config.keep_alive_timeout(connect.keep_alive);

        let (resp_tx, resp_rx) = oneshot::channel();
        self.broker
            .send(DispatcherToBrokerCmd::OpenSession {
                client_id: self.client_id.clone(),
                clean: connect.clean_session,
                dispatcher: self.self_tx.clone(),
                resp: resp_tx,
            })
            .await?;
        let outcome = resp_rx
            .await
            .map_err(|_| Error::new(ErrorKind::Session, "broker dropped open-session response"))?;

        let will = connect.will.as_ref().map(|w| WillMessage {
            topic: w.topic.clone(),
            payload: w.message.clone(),
            qos: w.qos,
            retain: w.retain,
        });
        self.broker
            .send(DispatcherToBrokerCmd::SetWill { client_id: self.client_id.clone(), will })
            .await?;

        let session_present = match outcome {
            OpenOutcome::Created => false,
            OpenOutcome::Resumed(queued) => {
                for message in queued {
                    self.send_publish(&message.topic, message.payload, message.qos, message.retain, true)
                        .await?;
                }
                true
            }
            OpenOutcome::Displaced(old) => {
                let _ = old.send(BrokerToDispatcherCmd::Close).await;
                !connect.clean_session
            }
        };

        self.write_packet(&ConnectAckPacket::new(ConnectReturnCode::Accepted, session_present))
            .await?;
        self.state = State::Connected;
        Ok(())
    }

    async fn on_connected_packet(&mut self, packet: VariablePacket) -> Result<(), Error> {
        match packet {
            VariablePacket::Connect(_) => Err(Error::new(ErrorKind::Protocol, "second CONNECT on one connection")),
            VariablePacket::Publish(publish) => self.on_publish(publish).await,
            VariablePacket::PublishAck(ack) => {
                self.outbound_inflight.remove(&ack.packet_id());
                Ok(())
            }
            VariablePacket::PublishReceived(received) => {
                self.write_packet(&PublishReleasePacket::new(received.packet_id())).await
            }
            VariablePacket::PublishRelease(release) => {
                self.pub_recv_pending.remove(&release.packet_id());
                self.write_packet(&PublishCompletePacket::new(release.packet_id())).await
            }
            VariablePacket::PublishComplete(complete) => {
                self.outbound_inflight.remove(&complete.packet_id());
                Ok(())
            }
            VariablePacket::Subscribe(subscribe) => self.on_subscribe(subscribe).await,
            VariablePacket::Unsubscribe(unsubscribe) => self.on_unsubscribe(unsubscribe).await,
            VariablePacket::PingRequest(_) => self.write_packet(&codec::v3::PingResponsePacket).await,
            VariablePacket::Disconnect(_) => {
                self.broker
                    .send(DispatcherToBrokerCmd::SetWill { client_id: self.client_id.clone(), will: None })
                    .await?;
                self.broker
                    .send(DispatcherToBrokerCmd::DetachSession {
                        client_id: self.client_id.clone(),
                        clean: self.clean_session,
                    })
                    .await?;
                self.state = State::Disconnecting;
                Ok(())
            }
            _ => Err(Error::new(ErrorKind::Protocol, "unexpected server-direction packet from client")),
        }
    }

    async fn on_publish(&mut self, publish: PublishPacket) -> Result<(), Error> {
        let qos = publish.qos();

        if qos == QoS::ExactlyOnce {
            if self.pub_recv_pending.len() >= self.session_config.max_inflight_messages {
                log::error!("client {}: too many unacknowledged qos=2 messages", self.client_id);
                self.state = State::Disconnecting;
                return Ok(());
            }
            if let Some(packet_id) = publish.packet_id() {
                self.pub_recv_pending.insert(packet_id);
            }
        }

        self.broker
            .send(DispatcherToBrokerCmd::Publish {
                topic: publish.topic().to_string(),
                payload: publish.payload().to_vec(),
                qos,
                retain: publish.retain(),
            })
            .await?;

        match (qos, publish.packet_id()) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.write_packet(&PublishAckPacket::new(packet_id)).await
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                self.write_packet(&PublishReceivedPacket::new(packet_id)).await
            }
            _ => Ok(()),
        }
    }

    async fn on_subscribe(&mut self, subscribe: SubscribePacket) -> Result<(), Error> {
        let mut reasons = Vec::with_capacity(subscribe.topics().len());
        for topic in subscribe.topics() {
            let (resp_tx, resp_rx) = oneshot::channel();
            self.broker
                .send(DispatcherToBrokerCmd::Subscribe {
                    filter: topic.filter().to_string(),
                    client_id: self.client_id.clone(),
                    qos: topic.qos(),
                    dispatcher: self.self_tx.clone(),
                    resp: resp_tx,
                })
                .await?;
            let granted = resp_rx
                .await
                .map_err(|_| Error::new(ErrorKind::Session, "broker dropped subscribe response"))?;
            reasons.push(match granted {
                Some(qos) => SubscribeAckReason::Granted(qos),
                None => SubscribeAckReason::Failure,
            });
        }
        self.write_packet(&SubscribeAckPacket::new(subscribe.packet_id(), reasons)).await
    }

    async fn on_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) -> Result<(), Error> {
        for filter in unsubscribe.topics() {
            self.broker
                .send(DispatcherToBrokerCmd::Unsubscribe {
                    filter: filter.clone(),
                    client_id: self.client_id.clone(),
                })
                .await?;
        }
        self.write_packet(&UnsubscribeAckPacket::new(unsubscribe.packet_id())).await
    }

    async fn handle_broker_cmd(&mut self, cmd: BrokerToDispatcherCmd) -> Result<(), Error> {
        match cmd {
            BrokerToDispatcherCmd::Publish { topic, payload, qos, retain, dup } => {
                self.send_publish(&topic, payload, qos, retain, dup).await
            }
            BrokerToDispatcherCmd::Close => {
                self.state = State::Disconnecting;
                Ok(())
            }
        }
    }

    async fn send_publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        dup: bool,
    ) -> Result<(), Error> {
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            let packet_id = self.packet_ids.allocate(&self.outbound_inflight);
            self.outbound_inflight.insert(packet_id);
            Some(packet_id)
        };

        let mut packet = PublishPacket::new(topic, qos, &payload)?.with_retain(retain).with_dup(dup);
        if let Some(packet_id) = packet_id {
            packet = packet.with_packet_id(packet_id);
        }
        self.write_packet(&packet).await
    }

    async fn write_packet(&mut self, packet: &impl EncodePacket) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    async fn on_abnormal_disconnect(&mut self) {
        if self.client_id.is_empty() {
            return;
        }
        let _ = self
            .broker
            .send(DispatcherToBrokerCmd::FireWill { client_id: self.client_id.clone() })
            .await;
        let _ = self
            .broker
            .send(DispatcherToBrokerCmd::DetachSession { client_id: self.client_id.clone(), clean: self.clean_session })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{ByteArray, DecodePacket};

    async fn spawn_broker() -> BrokerHandle {
        let broker = crate::broker::Broker::new(&config::Session::default());
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(broker.run(rx));
        tx
    }

    #[tokio::test]
    async fn qos2_handshake_scenario() {
        let broker = spawn_broker().await;
        let (client, server) = tokio::io::duplex(4096);
        let dispatcher = Dispatcher::new(server, broker, config::Session::default());
        tokio::spawn(dispatcher.serve());

        let (mut read_half, mut write_half) = tokio::io::split(client);

        let connect = ConnectPacket::new("client-a", true, 60);
        let mut buf = Vec::new();
        connect.encode(&mut buf).unwrap();
        write_half.write_all(&buf).await.unwrap();

        let mut resp = vec![0u8; 64];
        let n = read_half.read(&mut resp).await.unwrap();
        let mut ba = ByteArray::new(&resp[..n]);
        let ack = ConnectAckPacket::decode(&mut ba).unwrap();
        assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);

        let publish = PublishPacket::new("t", QoS::ExactlyOnce, b"x")
            .unwrap()
            .with_packet_id(PacketId::new(7));
        let mut buf = Vec::new();
        publish.encode(&mut buf).unwrap();
        write_half.write_all(&buf).await.unwrap();

        let mut resp = vec![0u8; 64];
        let n = read_half.read(&mut resp).await.unwrap();
        let mut ba = ByteArray::new(&resp[..n]);
        let received = PublishReceivedPacket::decode(&mut ba).unwrap();
        assert_eq!(received.packet_id(), PacketId::new(7));

        let release = PublishReleasePacket::new(PacketId::new(7));
        let mut buf = Vec::new();
        release.encode(&mut buf).unwrap();
        write_half.write_all(&buf).await.unwrap();

        let mut resp = vec![0u8; 64];
        let n = read_half.read(&mut resp).await.unwrap();
        let mut ba = ByteArray::new(&resp[..n]);
        let complete = PublishCompletePacket::decode(&mut ba).unwrap();
        assert_eq!(complete.packet_id(), PacketId::new(7));
    }
}

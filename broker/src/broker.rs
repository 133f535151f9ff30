// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Broker facade: the single entry point from a dispatcher to the shared
//! subscription trie, retain trie and session store (§4.6).
//!
//! Every method here is expected to run on one event-loop task; there are
//! no internal locks.

use codec::QoS;
use mapping::MappingDocument;
use tokio::sync::mpsc;

use crate::commands::{BrokerToDispatcherCmd, DispatcherHandle, DispatcherToBrokerCmd};
use crate::config;
use crate::mapping_bridge::{MappingBridge, CONFIG_MAPPING_TOPIC};
use crate::session::{OpenOutcome, QueuedMessage, SessionStore, WillMessage};
use crate::subscription_tree::SubscriptionTree;
use crate::retain_tree::RetainTree;
use crate::topic::validate_pub_topic;

pub struct Broker {
    subscriptions: SubscriptionTree,
    retained: RetainTree,
    sessions: SessionStore,
    broker_max_qos: QoS,
    mapping_bridge: Option<MappingBridge>,
}

impl Broker {
    #[must_use]
    pub fn new(config: &config::Session) -> Self {
        let broker_max_qos = QoS::try_from(config.broker_max_qos.min(2)).unwrap_or(QoS::ExactlyOnce);
        Broker {
            subscriptions: SubscriptionTree::new(),
            retained: RetainTree::new(),
            sessions: SessionStore::new(config.max_queued_messages),
            broker_max_qos,
            mapping_bridge: None,
        }
    }

    pub fn open_session(
        &mut self,
        client_id: &str,
        clean: bool,
        dispatcher: DispatcherHandle,
    ) -> OpenOutcome {
        if clean {
            self.subscriptions.unsubscribe_all(client_id);
        }
        self.sessions.open(client_id, clean, dispatcher)
    }

    pub fn detach_session(&mut self, client_id: &str, clean: bool) {
        if clean {
            self.subscriptions.unsubscribe_all(client_id);
        }
        self.sessions.detach(client_id, clean);
    }

    pub fn set_will(&mut self, client_id: &str, will: Option<WillMessage>) {
        self.sessions.set_will(client_id, will);
    }

    /// Called on abnormal disconnect only; publishes and clears the will.
    pub fn fire_will(&mut self, client_id: &str) {
        if let Some(will) = self.sessions.take_will(client_id) {
            self.publish(&will.topic, will.payload, will.qos, will.retain);
        }
    }

    /// §4.6 `subscribe`. Replays matching retained messages afterwards.
    pub fn subscribe(
        &mut self,
        filter: &str,
        client_id: &str,
        requested_qos: QoS,
        dispatcher: &DispatcherHandle,
    ) -> Option<QoS> {
        let granted = self
            .subscriptions
            .subscribe(filter, client_id, requested_qos, self.broker_max_qos)?;

        let mut to_send = Vec::new();
        self.retained.replay_filter(filter, granted, |msg, qos| {
            to_send.push(BrokerToDispatcherCmd::Publish {
                topic: msg.topic.clone(),
                payload: msg.payload.clone(),
                qos,
                retain: true,
                dup: false,
            });
        });
        for cmd in to_send {
            let _ = dispatcher.try_send(cmd);
        }
        Some(granted)
    }

    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) {
        self.subscriptions.unsubscribe(filter, client_id);
    }

    /// §4.6 `publish`. Matches subscribers, hands each its effective QoS
    /// delivery, and runs the broker-side mapping bridge (§4.7) once the
    /// ordinary delivery has gone out. Publishing to [`CONFIG_MAPPING_TOPIC`]
    /// (the integrator's retained mapping-document announcement) loads or
    /// clears the bridge instead of being matched against subscribers.
    pub fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) {
        if validate_pub_topic(topic).is_err() {
            log::warn!("broker: refusing to publish to invalid topic {topic}");
            return;
        }

        if topic == CONFIG_MAPPING_TOPIC {
            self.reload_mapping_bridge(&payload);
        }

        self.publish_direct(topic, payload.clone(), qos, retain);

        if let Some(bridge) = self.mapping_bridge.take() {
            bridge.apply(self, topic, &payload, qos);
            self.mapping_bridge = Some(bridge);
        }
    }

    /// The ordinary half of `publish`: matches subscribers and updates the
    /// retain tree, without touching the mapping bridge. Derived publishes
    /// produced by [`MappingBridge::apply`] go through this, never through
    /// `publish`, so translation is never re-applied to its own output.
    pub(crate) fn publish_direct(&mut self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) {
        if retain {
            self.retained.retain(topic, payload.clone(), qos);
        }

        let matched = self.subscriptions.match_topic(topic);
        for subscriber in matched {
            let effective_qos = qos.min(subscriber.qos);
            let message = QueuedMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                qos: effective_qos,
                retain,
            };
            if let Some(dispatcher) = self.sessions.deliver(&subscriber.client_id, message) {
                let _ = dispatcher.try_send(BrokerToDispatcherCmd::Publish {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    qos: effective_qos,
                    retain,
                    dup: false,
                });
            }
        }
    }

    /// Load, replace or clear the mapping bridge from a publish on
    /// [`CONFIG_MAPPING_TOPIC`]; an empty payload clears it the same way an
    /// empty retained payload clears a retain-tree entry.
    fn reload_mapping_bridge(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            self.mapping_bridge = None;
            return;
        }
        let raw = match std::str::from_utf8(payload) {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("broker: mapping document on {CONFIG_MAPPING_TOPIC} was not valid utf-8: {err}");
                return;
            }
        };
        match MappingDocument::parse_str(raw) {
            Ok(document) => self.mapping_bridge = Some(MappingBridge::new(document)),
            Err(err) => log::warn!("broker: invalid mapping document on {CONFIG_MAPPING_TOPIC}: {err}"),
        }
    }

    pub fn is_active(&self, client_id: &str) -> bool {
        self.sessions.is_active(client_id)
    }

    /// Every retained session's will, queued messages and subscriptions,
    /// for [`crate::persistence`] to serialize.
    pub fn retained_sessions(&self) -> Vec<(String, Option<WillMessage>, Vec<QueuedMessage>, Vec<(String, QoS)>)> {
        self.sessions
            .retained_snapshot()
            .into_iter()
            .map(|(client_id, will, queued)| {
                let subs = self.subscriptions.subscriptions_of(&client_id);
                (client_id, will, queued, subs)
            })
            .collect()
    }

    /// Recreate a retained session from a persisted snapshot. Startup-only.
    pub fn restore_session(
        &mut self,
        client_id: String,
        will: Option<WillMessage>,
        queued: Vec<QueuedMessage>,
        subscriptions: Vec<(String, QoS)>,
    ) {
        for (filter, qos) in subscriptions {
            self.subscriptions
                .subscribe(&filter, &client_id, qos, self.broker_max_qos);
        }
        self.sessions.restore(client_id, will, queued);
    }

    /// Drive the broker from a single task, processing one
    /// [`DispatcherToBrokerCmd`] at a time. All mutation of the shared
    /// tries and session store happens here; no locks are needed since
    /// only this loop ever touches `self`.
    ///
    /// Returns `self` once every sender side of `commands` has been
    /// dropped, so the caller can persist a final snapshot before exit.
    pub async fn run(mut self, mut commands: mpsc::Receiver<DispatcherToBrokerCmd>) -> Self {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                DispatcherToBrokerCmd::OpenSession { client_id, clean, dispatcher, resp } => {
                    let outcome = self.open_session(&client_id, clean, dispatcher);
                    let _ = resp.send(outcome);
                }
                DispatcherToBrokerCmd::DetachSession { client_id, clean } => {
                    self.detach_session(&client_id, clean);
                }
                DispatcherToBrokerCmd::SetWill { client_id, will } => {
                    self.set_will(&client_id, will);
                }
                DispatcherToBrokerCmd::FireWill { client_id } => {
                    self.fire_will(&client_id);
                }
                DispatcherToBrokerCmd::Subscribe { filter, client_id, qos, dispatcher, resp } => {
                    let granted = self.subscribe(&filter, &client_id, qos, &dispatcher);
                    let _ = resp.send(granted);
                }
                DispatcherToBrokerCmd::Unsubscribe { filter, client_id } => {
                    self.unsubscribe(&filter, &client_id);
                }
                DispatcherToBrokerCmd::Publish { topic, payload, qos, retain } => {
                    self.publish(&topic, payload, qos, retain);
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle() -> (DispatcherHandle, mpsc::Receiver<BrokerToDispatcherCmd>) {
        mpsc::channel(16)
    }

    fn broker() -> Broker {
        Broker::new(&config::Session::default())
    }

    #[test]
    fn retained_replay_on_subscribe() {
        let mut broker = broker();
        broker.publish("room/temp", b"22".to_vec(), QoS::AtMostOnce, true);

        let (tx, mut rx) = handle();
        broker.subscribe("room/#", "b", QoS::AtMostOnce, &tx);

        let cmd = rx.try_recv().unwrap();
        match cmd {
            BrokerToDispatcherCmd::Publish { topic, payload, retain, .. } => {
                assert_eq!(topic, "room/temp");
                assert_eq!(payload, b"22");
                assert!(retain);
            }
            _ => panic!("expected publish"),
        }
    }

    #[test]
    fn clean_session_reclaim_drops_prior_subscriptions() {
        let mut broker = broker();
        let (tx, _rx) = handle();
        broker.open_session("x", true, tx.clone());
        broker.subscribe("a/b", "x", QoS::AtMostOnce, &tx);
        broker.detach_session("x", false);

        let (tx2, mut rx2) = handle();
        broker.open_session("x", true, tx2.clone());

        broker.publish("a/b", b"live".to_vec(), QoS::AtMostOnce, false);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn empty_payload_retain_clears_and_still_fans_out() {
        let mut broker = broker();
        broker.publish("t", b"x".to_vec(), QoS::AtMostOnce, true);

        let (tx, mut rx) = handle();
        broker.open_session("s", true, tx.clone());
        broker.subscribe("t", "s", QoS::AtMostOnce, &tx);
        let _ = rx.try_recv();

        broker.publish("t", Vec::new(), QoS::AtMostOnce, true);
        assert!(rx.try_recv().is_ok());

        let (tx2, mut rx2) = handle();
        broker.subscribe("t", "s2", QoS::AtMostOnce, &tx2);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn publishing_mapping_document_wires_up_live_translation() {
        let mut broker = broker();
        let (tx, mut rx) = handle();
        broker.open_session("watcher", true, tx.clone());
        broker.subscribe("a/b", "watcher", QoS::AtMostOnce, &tx);

        let document = serde_json::json!({
            "mappings": {
                "name": "a",
                "topic_level": {
                    "name": "b",
                    "subscription": {
                        "qos": 0,
                        "static": {
                            "mapped_topic": "a/b",
                            "retain_message": false,
                            "message_mapping": [{"message": "x", "mapped_message": "y"}]
                        }
                    }
                }
            }
        })
        .to_string();
        broker.publish(CONFIG_MAPPING_TOPIC, document.into_bytes(), QoS::AtMostOnce, true);

        broker.publish("a/b", b"x".to_vec(), QoS::AtMostOnce, false);

        let cmd = rx.try_recv().unwrap();
        match cmd {
            BrokerToDispatcherCmd::Publish { payload, .. } => assert_eq!(payload, b"y"),
            _ => panic!("expected publish"),
        }
    }

    #[test]
    fn empty_payload_on_mapping_topic_clears_bridge() {
        let mut broker = broker();
        let document = serde_json::json!({
            "mappings": {
                "name": "a",
                "subscription": {
                    "qos": 0,
                    "static": {
                        "mapped_topic": "a/out",
                        "retain_message": false,
                        "message_mapping": [{"message": "x", "mapped_message": "y"}]
                    }
                }
            }
        })
        .to_string();
        broker.publish(CONFIG_MAPPING_TOPIC, document.into_bytes(), QoS::AtMostOnce, true);
        broker.publish(CONFIG_MAPPING_TOPIC, Vec::new(), QoS::AtMostOnce, true);

        let (tx, mut rx) = handle();
        broker.open_session("watcher", true, tx.clone());
        broker.subscribe("a/out", "watcher", QoS::AtMostOnce, &tx);
        broker.publish("a", b"x".to_vec(), QoS::AtMostOnce, false);
        assert!(rx.try_recv().is_err());
    }
}

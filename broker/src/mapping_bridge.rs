// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Wires a loaded mapping document into the broker side of the mapping
//! feature (§4.7): every accepted publish is additionally run through
//! [`MappingDocument::translate`], and each derived publish is fed back
//! into the broker as an ordinary publish.
//!
//! Derived publishes are **not** translated again; `translate` is only
//! ever called with the original publish's topic and payload.

use codec::QoS;
use mapping::MappingDocument;

use crate::broker::Broker;

/// Retained topic the integrator publishes its mapping document to on
/// connect (mirrors `integrator::client::CFG_MAPPING_TOPIC`); the broker
/// loads or clears its [`MappingBridge`] whenever a publish lands here.
pub const CONFIG_MAPPING_TOPIC: &str = "snode.c/_cfg_/mapping";

pub struct MappingBridge {
    document: MappingDocument,
}

impl MappingBridge {
    #[must_use]
    pub fn new(document: MappingDocument) -> Self {
        MappingBridge { document }
    }

    /// Run `topic`/`payload` through the mapping document and publish
    /// every derived message on `broker`. Call this right after an
    /// ordinary `Broker::publish` for the same message, and always through
    /// `Broker::publish_direct` so derived publishes are never translated a
    /// second time (§4.7).
    pub fn apply(&self, broker: &mut Broker, topic: &str, payload: &[u8], qos: QoS) {
        for derived in self.document.translate(topic, payload, qos as u8) {
            let derived_qos = QoS::try_from(derived.qos.min(2)).unwrap_or(QoS::AtMostOnce);
            broker.publish_direct(&derived.topic, derived.payload.into_bytes(), derived_qos, derived.retain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn document(json: serde_json::Value) -> MappingDocument {
        MappingDocument::parse_str(&json.to_string()).unwrap()
    }

    #[test]
    fn derived_publish_is_not_translated_again() {
        let doc = document(serde_json::json!({
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
        }));
        let bridge = MappingBridge::new(doc);
        let mut broker = Broker::new(&config::Session::default());

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        broker.open_session("watcher", true, tx.clone());
        broker.subscribe("a/b", "watcher", QoS::AtMostOnce, &tx);

        bridge.apply(&mut broker, "a/b", b"x", QoS::AtMostOnce);

        let cmd = rx.try_recv().unwrap();
        match cmd {
            crate::commands::BrokerToDispatcherCmd::Publish { payload, .. } => {
                assert_eq!(payload, b"y");
            }
            _ => panic!("expected publish"),
        }
    }
}

// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Session store: `client_id -> SessionRecord`, covering the absent /
//! active / retained lifecycle of §3.

use std::collections::{HashMap, VecDeque};

use codec::QoS;
use serde::{Deserialize, Serialize};

use crate::commands::DispatcherHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug)]
struct SessionRecord {
    clean_session: bool,
    dispatcher: Option<DispatcherHandle>,
    will: Option<WillMessage>,
    queued: VecDeque<QueuedMessage>,
}

impl SessionRecord {
    fn new_active(clean_session: bool, dispatcher: DispatcherHandle) -> Self {
        SessionRecord {
            clean_session,
            dispatcher: Some(dispatcher),
            will: None,
            queued: VecDeque::new(),
        }
    }
}

/// Outcome of [`SessionStore::open`].
#[derive(Debug)]
pub enum OpenOutcome {
    /// No prior session existed for this client id.
    Created,
    /// A retained session was reattached; its queued messages should now
    /// be replayed with `dup = true`.
    Resumed(Vec<QueuedMessage>),
    /// An active session already existed under this client id; its prior
    /// dispatcher is returned so the caller can close that connection.
    Displaced(DispatcherHandle),
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, SessionRecord>,
    max_queued_messages: usize,
}

impl SessionStore {
    #[must_use]
    pub fn new(max_queued_messages: usize) -> Self {
        SessionStore {
            sessions: HashMap::new(),
            max_queued_messages,
        }
    }

    /// Attach `dispatcher` to `client_id`'s session (§4.4 `open`).
    pub fn open(&mut self, client_id: &str, clean: bool, dispatcher: DispatcherHandle) -> OpenOutcome {
        if let Some(old) = self
            .sessions
            .get(client_id)
            .and_then(|record| record.dispatcher.clone())
        {
            if clean {
                self.sessions
                    .insert(client_id.to_string(), SessionRecord::new_active(clean, dispatcher));
            } else if let Some(record) = self.sessions.get_mut(client_id) {
                record.clean_session = false;
                record.dispatcher = Some(dispatcher);
            }
            return OpenOutcome::Displaced(old);
        }

        match self.sessions.get_mut(client_id) {
            None => {
                self.sessions
                    .insert(client_id.to_string(), SessionRecord::new_active(clean, dispatcher));
                OpenOutcome::Created
            }
            Some(_) if clean => {
                self.sessions
                    .insert(client_id.to_string(), SessionRecord::new_active(clean, dispatcher));
                OpenOutcome::Created
            }
            Some(record) => {
                record.clean_session = false;
                record.dispatcher = Some(dispatcher);
                OpenOutcome::Resumed(record.queued.drain(..).collect())
            }
        }
    }

    /// Called on disconnect. A clean session is dropped entirely; otherwise
    /// it is retained (dispatcher cleared, subscriptions and queue kept).
    pub fn detach(&mut self, client_id: &str, clean: bool) {
        if clean {
            self.sessions.remove(client_id);
        } else if let Some(record) = self.sessions.get_mut(client_id) {
            record.dispatcher = None;
        }
    }

    pub fn set_will(&mut self, client_id: &str, will: Option<WillMessage>) {
        if let Some(record) = self.sessions.get_mut(client_id) {
            record.will = will;
        }
    }

    /// Consume and return the stored will, if any. Call only on abnormal
    /// disconnect; a graceful DISCONNECT must not call this.
    pub fn take_will(&mut self, client_id: &str) -> Option<WillMessage> {
        self.sessions.get_mut(client_id)?.will.take()
    }

    pub fn is_active(&self, client_id: &str) -> bool {
        self.sessions
            .get(client_id)
            .is_some_and(|record| record.dispatcher.is_some())
    }

    /// Collect every currently-retained (disconnected, non-clean) session
    /// for persistence: its will and queued messages. Active sessions are
    /// not snapshotted since their live dispatcher handle cannot survive
    /// a restart.
    pub fn retained_snapshot(&self) -> Vec<(String, Option<WillMessage>, Vec<QueuedMessage>)> {
        self.sessions
            .iter()
            .filter(|(_, record)| record.dispatcher.is_none())
            .map(|(client_id, record)| {
                (
                    client_id.clone(),
                    record.will.clone(),
                    record.queued.iter().cloned().collect(),
                )
            })
            .collect()
    }

    /// Recreate a retained session from a persisted snapshot. Used on
    /// startup only, before any connection has arrived.
    pub fn restore(&mut self, client_id: String, will: Option<WillMessage>, queued: Vec<QueuedMessage>) {
        self.sessions.insert(
            client_id,
            SessionRecord {
                clean_session: false,
                dispatcher: None,
                will,
                queued: queued.into_iter().collect(),
            },
        );
    }

    /// Hand `message` to the dispatcher if active; enqueue if retained and
    /// `qos >= 1`; drop otherwise. Returns `true` if the dispatcher handle
    /// should be used by the caller to actually push the command (the
    /// store itself holds no reference to the broker's outbound channel
    /// logic beyond the handle).
    pub fn deliver(&mut self, client_id: &str, message: QueuedMessage) -> Option<DispatcherHandle> {
        let record = self.sessions.get_mut(client_id)?;
        if let Some(dispatcher) = &record.dispatcher {
            return Some(dispatcher.clone());
        }
        if message.qos != QoS::AtMostOnce {
            if record.queued.len() >= self.max_queued_messages {
                record.queued.pop_front();
                log::warn!("session {client_id}: queued message dropped, queue at capacity");
            }
            record.queued.push_back(message);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (DispatcherHandle, tokio::sync::mpsc::Receiver<crate::commands::BrokerToDispatcherCmd>) {
        tokio::sync::mpsc::channel(8)
    }

    #[test]
    fn fresh_client_id_creates_session() {
        let mut store = SessionStore::new(10);
        let (tx, _rx) = handle();
        assert!(matches!(store.open("a", true, tx), OpenOutcome::Created));
    }

    #[test]
    fn clean_disconnect_discards_session() {
        let mut store = SessionStore::new(10);
        let (tx, _rx) = handle();
        store.open("a", true, tx);
        store.detach("a", true);
        assert!(!store.is_active("a"));
        let (tx2, _rx2) = handle();
        assert!(matches!(store.open("a", false, tx2), OpenOutcome::Created));
    }

    #[test]
    fn non_clean_disconnect_then_resume_replays_queue_in_order() {
        let mut store = SessionStore::new(10);
        let (tx, _rx) = handle();
        store.open("a", false, tx);
        store.detach("a", false);

        store.deliver(
            "a",
            QueuedMessage {
                topic: "t1".into(),
                payload: b"1".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: false,
            },
        );
        store.deliver(
            "a",
            QueuedMessage {
                topic: "t2".into(),
                payload: b"2".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: false,
            },
        );

        let (tx2, _rx2) = handle();
        match store.open("a", false, tx2) {
            OpenOutcome::Resumed(queued) => {
                assert_eq!(queued.len(), 2);
                assert_eq!(queued[0].topic, "t1");
                assert_eq!(queued[1].topic, "t2");
            }
            other => panic!("expected Resumed, got {other:?}"),
        }
    }

    #[test]
    fn qos0_message_dropped_for_retained_session() {
        let mut store = SessionStore::new(10);
        let (tx, _rx) = handle();
        store.open("a", false, tx);
        store.detach("a", false);

        store.deliver(
            "a",
            QueuedMessage {
                topic: "t".into(),
                payload: b"x".to_vec(),
                qos: QoS::AtMostOnce,
                retain: false,
            },
        );

        let (tx2, _rx2) = handle();
        match store.open("a", false, tx2) {
            OpenOutcome::Resumed(queued) => assert!(queued.is_empty()),
            other => panic!("expected Resumed, got {other:?}"),
        }
    }

    #[test]
    fn second_connect_while_active_reports_displaced() {
        let mut store = SessionStore::new(10);
        let (tx1, _rx1) = handle();
        store.open("a", true, tx1);
        let (tx2, _rx2) = handle();
        assert!(matches!(store.open("a", true, tx2), OpenOutcome::Displaced(_)));
    }

    #[test]
    fn queue_bound_drops_oldest() {
        let mut store = SessionStore::new(1);
        let (tx, _rx) = handle();
        store.open("a", false, tx);
        store.detach("a", false);

        for i in 0..3u8 {
            store.deliver(
                "a",
                QueuedMessage {
                    topic: format!("t{i}"),
                    payload: vec![i],
                    qos: QoS::AtLeastOnce,
                    retain: false,
                },
            );
        }

        let (tx2, _rx2) = handle();
        match store.open("a", false, tx2) {
            OpenOutcome::Resumed(queued) => {
                assert_eq!(queued.len(), 1);
                assert_eq!(queued[0].topic, "t2");
            }
            other => panic!("expected Resumed, got {other:?}"),
        }
    }
}

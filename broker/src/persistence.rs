// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Optional binary snapshot of retained sessions, written on graceful
//! shutdown and loaded back on startup when `general.session_store` is
//! set (§6). A live dispatcher handle cannot be serialized, so only
//! sessions with no active connection at the time of the snapshot are
//! captured; anything still connected is expected to reconnect on its
//! own and rebuild its session state normally.

use std::path::Path;

use codec::QoS;
use serde::{Deserialize, Serialize};

use crate::broker::Broker;
use crate::error::Error;
use crate::session::{QueuedMessage, WillMessage};

#[derive(Debug, Serialize, Deserialize)]
struct SessionSnapshot {
    client_id: String,
    will: Option<WillMessage>,
    queued: Vec<QueuedMessage>,
    subscriptions: Vec<(String, QoS)>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Snapshot {
    sessions: Vec<SessionSnapshot>,
}

/// Serialize every retained session in `broker` to `path`.
pub fn save(path: impl AsRef<Path>, broker: &Broker) -> Result<(), Error> {
    let sessions = broker
        .retained_sessions()
        .into_iter()
        .map(|(client_id, will, queued, subscriptions)| SessionSnapshot {
            client_id,
            will,
            queued,
            subscriptions,
        })
        .collect();
    let snapshot = Snapshot { sessions };
    let bytes = bincode::serialize(&snapshot)
        .map_err(|err| Error::from_string(crate::error::ErrorKind::Session, err.to_string()))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Load a previously saved snapshot and repopulate `broker` with it.
/// Call once at startup, before the listener starts accepting connections.
pub fn load(path: impl AsRef<Path>, broker: &mut Broker) -> Result<(), Error> {
    let path = path.as_ref();
    if !path.exists() {
        log::info!("persistence: no session store found at {}, starting empty", path.display());
        return Ok(());
    }
    let bytes = std::fs::read(path)?;
    let snapshot: Snapshot = bincode::deserialize(&bytes)
        .map_err(|err| Error::from_string(crate::error::ErrorKind::Session, err.to_string()))?;
    for session in snapshot.sessions {
        broker.restore_session(session.client_id, session.will, session.queued, session.subscriptions);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[test]
    fn round_trips_a_retained_session() {
        let mut broker = Broker::new(&config::Session::default());
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        broker.open_session("client-a", false, tx);
        broker.subscribe("room/#", "client-a", QoS::AtLeastOnce, &{
            let (tx2, _rx2) = tokio::sync::mpsc::channel(8);
            tx2
        });
        broker.detach_session("client-a", false);
        broker.publish("room/temp", b"hot".to_vec(), QoS::AtLeastOnce, false);

        let dir = std::env::temp_dir().join(format!("mqtt-broker-persistence-test-{}", std::process::id()));
        save(&dir, &broker).unwrap();

        let mut restored = Broker::new(&config::Session::default());
        load(&dir, &mut restored).unwrap();
        std::fs::remove_file(&dir).unwrap();

        assert!(!restored.is_active("client-a"));
        let (tx3, _rx3) = tokio::sync::mpsc::channel(8);
        match restored.open_session("client-a", false, tx3) {
            crate::session::OpenOutcome::Resumed(queued) => {
                assert_eq!(queued.len(), 1);
                assert_eq!(queued[0].topic, "room/temp");
            }
            other => panic!("expected Resumed, got {other:?}"),
        }
    }
}

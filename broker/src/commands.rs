// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Commands exchanged between the broker facade and per-connection dispatchers.

use codec::QoS;
use tokio::sync::{mpsc, oneshot};

use crate::session::{OpenOutcome, WillMessage};

/// Handle the broker facade uses to push outbound work to a connected
/// dispatcher. Cloned into the session store on CONNECT.
pub type DispatcherHandle = mpsc::Sender<BrokerToDispatcherCmd>;

/// Handle every dispatcher holds to reach the single broker task.
pub type BrokerHandle = mpsc::Sender<DispatcherToBrokerCmd>;

#[derive(Debug, Clone)]
pub enum BrokerToDispatcherCmd {
    /// Deliver a publish to this dispatcher's client.
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        dup: bool,
    },
    /// Forcibly close the connection; a newer CONNECT displaced it.
    Close,
}

/// Commands dispatchers send to the single broker task. Operations whose
/// caller needs a return value carry a one-shot response channel.
#[derive(Debug)]
pub enum DispatcherToBrokerCmd {
    OpenSession {
        client_id: String,
        clean: bool,
        dispatcher: DispatcherHandle,
        resp: oneshot::Sender<OpenOutcome>,
    },
    DetachSession {
        client_id: String,
        clean: bool,
    },
    SetWill {
        client_id: String,
        will: Option<WillMessage>,
    },
    FireWill {
        client_id: String,
    },
    Subscribe {
        filter: String,
        client_id: String,
        qos: QoS,
        dispatcher: DispatcherHandle,
        resp: oneshot::Sender<Option<QoS>>,
    },
    Unsubscribe {
        filter: String,
        client_id: String,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
}

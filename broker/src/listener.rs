// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! The one transport binding this broker actually implements: plain TCP.
//! Each accepted connection is handed to its own [`Dispatcher`] task; the
//! listener itself holds no session state.

use tokio::net::TcpListener;

use crate::commands::BrokerHandle;
use crate::config;
use crate::dispatcher::Dispatcher;
use crate::error::Error;

pub struct Listener {
    tcp: TcpListener,
    broker: BrokerHandle,
    session_config: config::Session,
}

impl Listener {
    pub async fn bind(address: &str, broker: BrokerHandle, session_config: config::Session) -> Result<Self, Error> {
        let tcp = TcpListener::bind(address).await?;
        Ok(Listener { tcp, broker, session_config })
    }

    /// Accept connections until the process is told to stop. Each
    /// connection runs its `Dispatcher` on its own task so one slow or
    /// malformed client never blocks another.
    pub async fn run_loop(&mut self) -> Result<(), Error> {
        loop {
            let (stream, peer_addr) = self.tcp.accept().await?;
            log::info!("listener: accepted connection from {peer_addr}");
            let dispatcher = Dispatcher::new(stream, self.broker.clone(), self.session_config.clone());
            tokio::spawn(async move {
                if let Err(err) = dispatcher.serve().await {
                    log::warn!("listener: connection from {peer_addr} ended with error: {err}");
                }
            });
        }
    }
}

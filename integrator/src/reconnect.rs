// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Fixed-delay reconnect supervisor (§5): on transport loss, redial
//! after a constant delay. The broker process itself never decides to
//! give up; only an operator-initiated shutdown ends the loop.

use std::time::Duration;

use tokio::net::TcpStream;

use mapping::MappingDocument;

use crate::client::Client;
use crate::error::Error;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connect to `address` and run one session to completion, then retry
/// after [`RECONNECT_DELAY`] unless `should_stop` reports true. Returns
/// only when told to stop.
pub async fn supervise(
    address: &str,
    document: MappingDocument,
    raw_document: String,
    mut should_stop: impl FnMut() -> bool,
) -> Result<(), Error> {
    loop {
        if should_stop() {
            return Ok(());
        }
        log::info!("integrator: connecting to {address}");
        match TcpStream::connect(address).await {
            Ok(stream) => {
                let client = Client::new(stream, document.clone(), raw_document.clone());
                if let Err(err) = client.run().await {
                    log::warn!("integrator: session ended: {err}");
                }
            }
            Err(err) => {
                log::warn!("integrator: failed to connect to {address}: {err}");
            }
        }
        if should_stop() {
            return Ok(());
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stops_immediately_when_told_to() {
        let document = MappingDocument::parse_str("{}").unwrap();
        let result = supervise("127.0.0.1:1", document, "{}".to_string(), || true).await;
        assert!(result.is_ok());
    }
}

// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

mod client;
mod error;
mod reconnect;

use clap::Arg;

use error::{Error, ErrorKind};
use mapping::MappingDocument;

const DEFAULT_DISCOVER_PREFIX: &str = "iotempower";
const DEFAULT_BROKER_ADDRESS: &str = "127.0.0.1:1883";

fn main() -> Result<(), Error> {
    std::env::set_var("RUST_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));
    env_logger::init();

    let matches = clap::App::new("mqtt-integrator")
        .version("0.1.0")
        .author("Xu Shaohua <shaohua@biofan.org>")
        .about("Bridges a device's native topics to a broker through a mapping document")
        .arg(
            Arg::with_name("mqtt-mapping-file")
                .long("mqtt-mapping-file")
                .value_name("path")
                .takes_value(true)
                .help("MQTT mapping file (json format) for integration"),
        )
        .arg(
            Arg::with_name("mqtt-discover-prefix")
                .long("mqtt-discover-prefix")
                .value_name("prefix")
                .takes_value(true)
                .default_value(DEFAULT_DISCOVER_PREFIX)
                .help("Topic prefix scoping the mapping subtree to apply"),
        )
        .arg(
            Arg::with_name("mqtt-broker-address")
                .long("mqtt-broker-address")
                .value_name("host:port")
                .takes_value(true)
                .help("Address of the broker to integrate with"),
        )
        .get_matches();

    let mapping_file = matches
        .value_of("mqtt-mapping-file")
        .map(str::to_string)
        .or_else(|| std::env::var("MQTT_MAPPING_FILE").ok())
        .ok_or_else(|| Error::new(ErrorKind::Mapping, "no mapping file given (--mqtt-mapping-file or MQTT_MAPPING_FILE)"))?;

    let discover_prefix = matches.value_of("mqtt-discover-prefix").unwrap_or(DEFAULT_DISCOVER_PREFIX);

    let broker_address = matches
        .value_of("mqtt-broker-address")
        .map(str::to_string)
        .or_else(|| std::env::var("MQTT_BROKER_ADDRESS").ok())
        .unwrap_or_else(|| DEFAULT_BROKER_ADDRESS.to_string());

    let raw_document = std::fs::read_to_string(&mapping_file)?;
    let mut document = MappingDocument::parse_str(&raw_document)?;
    // Scope the mapping tree to the subtree rooted at --mqtt-discover-prefix,
    // matching how the device discovers which slice of a shared mapping
    // file applies to it.
    document.roots.retain(|root| root.name == discover_prefix);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
        let running_for_signal = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("integrator: received ctrl-c, shutting down");
                running_for_signal.store(false, std::sync::atomic::Ordering::SeqCst);
            }
        });

        reconnect::supervise(&broker_address, document, raw_document, || {
            !running.load(std::sync::atomic::Ordering::SeqCst)
        })
        .await
    })
}

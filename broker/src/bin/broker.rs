// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use clap::Arg;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use broker::broker::Broker;
use broker::config::Config;
use broker::error::{Error, ErrorKind};
use broker::listener::Listener;
use broker::log::init_log;
use broker::persistence;

pub const DEFAULT_CONFIG: &str = "/etc/mqtt-broker/broker.toml";
const CHANNEL_CAPACITY: usize = 64;

fn main() -> Result<(), Error> {
    let matches = clap::App::new("mqtt-broker")
        .version("0.1.0")
        .author("Xu Shaohua <shaohua@biofan.org>")
        .about("MQTT 3.1.1 broker")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("config_file")
                .takes_value(true)
                .help("Specify config file path"),
        )
        .arg(
            Arg::with_name("test")
                .short("t")
                .long("test")
                .takes_value(false)
                .help("Test config file and exit"),
        )
        .get_matches();

    let config_file = matches.value_of("config").unwrap_or(DEFAULT_CONFIG);
    let config_content = std::fs::read_to_string(config_file)?;
    let config = Config::from_str(&config_content)
        .map_err(|err| Error::from_string(ErrorKind::Config, format!("invalid config: {err:?}")))?;

    if matches.is_present("test") {
        println!("The configuration file {config_file} syntax is Ok");
        return Ok(());
    }

    init_log(&config.log)?;

    let session_store = std::env::var("MQTT_SESSION_STORE")
        .ok()
        .or_else(|| config.general.session_store.clone());

    let runtime = Runtime::new()?;
    runtime.block_on(run(config, session_store))
}

async fn run(config: Config, session_store: Option<String>) -> Result<(), Error> {
    let mut broker = Broker::new(&config.session);

    if let Some(path) = &session_store {
        persistence::load(path, &mut broker)?;
    }

    let (broker_to_commands_tx, broker_to_commands_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let broker_task = tokio::spawn(broker.run(broker_to_commands_rx));

    let mut listener = Listener::bind(
        &config.general.listen_address,
        broker_to_commands_tx.clone(),
        config.session.clone(),
    )
    .await?;
    log::info!("listening on {}", config.general.listen_address);

    tokio::select! {
        result = listener.run_loop() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received ctrl-c, shutting down");
        }
    }

    // Drop every sender this task owns so the broker's command channel can
    // close once in-flight connections finish draining their own handles.
    drop(broker_to_commands_tx);
    drop(listener);

    if let Some(path) = &session_store {
        match broker_task.await {
            Ok(broker) => persistence::save(path, &broker)?,
            Err(err) => log::warn!("broker task panicked before shutdown snapshot: {err}"),
        }
    }

    Ok(())
}

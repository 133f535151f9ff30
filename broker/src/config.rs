// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! TOML-backed broker configuration.

use serde::Deserialize;
use std::time::Duration;

fn default_listen_address() -> String {
    "0.0.0.0:1883".to_string()
}

fn default_max_inflight_messages() -> usize {
    20
}

fn default_max_queued_messages() -> usize {
    100
}

fn default_broker_max_qos() -> u8 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: General,

    #[serde(default)]
    pub log: Log,

    #[serde(default)]
    pub session: Session,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: General::default(),
            log: Log::default(),
            session: Session::default(),
        }
    }
}

impl Config {
    pub fn from_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Optional path to a binary session-store snapshot, persisted on
    /// graceful shutdown and loaded back on startup.
    pub session_store: Option<String>,
}

impl Default for General {
    fn default() -> Self {
        General {
            listen_address: default_listen_address(),
            session_store: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default = "default_true")]
    pub console_log: bool,

    pub log_file: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for Log {
    fn default() -> Self {
        Log {
            log_level: LogLevel::default(),
            console_log: true,
            log_file: None,
        }
    }
}

/// Per-session defaults, applied to every connection this broker accepts.
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    #[serde(default = "default_max_inflight_messages")]
    pub max_inflight_messages: usize,

    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,

    #[serde(default = "default_broker_max_qos")]
    pub broker_max_qos: u8,
}

impl Default for Session {
    fn default() -> Self {
        Session {
            max_inflight_messages: default_max_inflight_messages(),
            max_queued_messages: default_max_queued_messages(),
            broker_max_qos: default_broker_max_qos(),
        }
    }
}

impl Session {
    /// A keep-alive of 0 means the client disabled the watchdog entirely
    /// (MQTT 3.1.1 §3.1.2.10); return an effectively infinite timeout rather
    /// than expiring on the very first watchdog tick.
    #[must_use]
    pub const fn keep_alive_timeout(&self, negotiated_keep_alive: u16) -> Duration {
        if negotiated_keep_alive == 0 {
            return Duration::MAX;
        }
        Duration::from_millis(negotiated_keep_alive as u64 * 1500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_sections_absent() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.general.listen_address, "0.0.0.0:1883");
        assert_eq!(config.session.max_queued_messages, 100);
        assert_eq!(config.session.broker_max_qos, 2);
    }

    #[test]
    fn parses_full_document() {
        let toml = r#"
            [general]
            listen_address = "127.0.0.1:1884"
            session_store = "/var/lib/broker/sessions.bin"

            [log]
            log_level = "debug"
            console_log = false
            log_file = "/var/log/broker.log"

            [session]
            max_inflight_messages = 5
            max_queued_messages = 50
            broker_max_qos = 1
        "#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.general.listen_address, "127.0.0.1:1884");
        assert_eq!(config.log.log_level, LogLevel::Debug);
        assert!(!config.log.console_log);
        assert_eq!(config.session.max_inflight_messages, 5);
    }

    #[test]
    fn zero_keep_alive_never_times_out() {
        let session = Session::default();
        assert_eq!(session.keep_alive_timeout(0), Duration::MAX);
        assert!(session.keep_alive_timeout(30) < Duration::MAX);
    }
}

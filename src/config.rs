use std::{
    fs::read_to_string,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use service::SessionOptions;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[default]
    Ipv4,
    Ipv6,
}

impl IpVersion {
    /// Wildcard address the session sockets bind to.
    pub fn unspecified(&self) -> IpAddr {
        match self {
            Self::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// A local session, as configured and as persisted by the store.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SessionConfig {
    pub local_name: String,
    ///
    /// Name announced to peers, defaults to the local name.
    ///
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonjour_name: Option<String>,
    ///
    /// Control port, must be even. The data port is the next one.
    ///
    #[serde(default = "SessionConfig::port")]
    pub port: u16,
    ///
    /// Synchronization source identifier, random when absent.
    ///
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default = "SessionConfig::enabled")]
    pub published: bool,
    ///
    /// Bind the sockets when the session is created.
    ///
    #[serde(default = "SessionConfig::enabled")]
    pub activated: bool,
    ///
    /// Coalesce the commands sent in one event loop turn into one packet.
    ///
    #[serde(default = "SessionConfig::enabled")]
    pub bundle: bool,
    #[serde(default)]
    pub ip_version: IpVersion,
}

impl SessionConfig {
    fn port() -> u16 {
        5004
    }

    fn enabled() -> bool {
        true
    }

    pub fn new(local_name: &str, port: u16) -> Self {
        Self {
            local_name: local_name.to_string(),
            bonjour_name: None,
            port,
            ssrc: None,
            published: true,
            activated: true,
            bundle: true,
            ip_version: IpVersion::default(),
        }
    }

    /// The name peers see.
    pub fn bonjour_name(&self) -> &str {
        self.bonjour_name.as_deref().unwrap_or(&self.local_name)
    }

    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            local_name: self.local_name.clone(),
            bonjour_name: self.bonjour_name().to_string(),
            ssrc: self.ssrc.unwrap_or_else(rand::random),
            published: self.published,
            bundle: self.bundle,
            port: self.port,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Remote {
    ///
    /// Local name of the session that invites the peer.
    ///
    pub session: String,
    ///
    /// Control port of the peer.
    ///
    pub address: SocketAddr,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Persistence {
    ///
    /// JSON file the session list is kept in.
    ///
    pub path: PathBuf,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub log: Log,
    ///
    /// Keep the session list in a file, in memory when absent.
    ///
    #[serde(default)]
    pub store: Option<Persistence>,
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
    ///
    /// Peers to invite once the sessions are up.
    ///
    #[serde(default)]
    pub remotes: Vec<Remote>,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: rtpmidi-server --config /etc/rtpmidi/config.json5
    ///
    #[arg(long, short)]
    config: String,
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(serde_json5::from_str(value)?)
    }
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// The configuration file path is taken from the command line, the file
    /// itself is JSON5.
    ///
    pub fn load() -> Result<Self> {
        read_to_string(&Cli::parse().config)?.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() -> Result<()> {
        let config: Config = r#"{
            sessions: [
                { "local-name": "studio" },
            ],
        }"#
        .parse()?;

        let session = &config.sessions[0];
        assert_eq!(session.port, 5004);
        assert_eq!(session.bonjour_name(), "studio");
        assert!(session.published && session.activated && session.bundle);
        assert_eq!(session.ip_version, IpVersion::Ipv4);
        assert!(config.store.is_none());
        assert!(config.remotes.is_empty());
        assert_eq!(config.log.level.as_level(), log::Level::Info);

        Ok(())
    }

    #[test]
    fn full() -> Result<()> {
        let config: Config = r#"{
            log: { level: "debug" },
            store: { path: "/var/lib/rtpmidi/sessions.json" },
            sessions: [
                {
                    "local-name": "studio",
                    "bonjour-name": "Studio Mac",
                    port: 5006,
                    ssrc: 1234,
                    published: false,
                    bundle: false,
                    "ip-version": "ipv6",
                },
            ],
            remotes: [
                { session: "studio", address: "192.168.1.20:5004" },
            ],
        }"#
        .parse()?;

        let options = config.sessions[0].options();
        assert_eq!(options.bonjour_name, "Studio Mac");
        assert_eq!(options.ssrc, 1234);
        assert_eq!(options.port, 5006);
        assert!(!options.bundle && !options.published);
        assert_eq!(config.sessions[0].ip_version.unspecified(), IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        assert_eq!(config.remotes[0].address, "192.168.1.20:5004".parse::<SocketAddr>()?);
        assert_eq!(config.log.level.as_level(), log::Level::Debug);

        Ok(())
    }
}

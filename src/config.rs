use std::{fs::read_to_string, str::FromStr};

use anyhow::Result;
use clap::Parser;
use codec::NodeAddress;
use serde::Deserialize;

/// Environment overrides for the advertised address, retained for
/// compatibility with deployments that template the environment rather
/// than the configuration file. They take precedence over the file and
/// are read once at startup.
pub const PUBLIC_HOST_ENV: &str = "CLUSTER_PUBLIC_HOST";
pub const PUBLIC_PORT_ENV: &str = "CLUSTER_PUBLIC_PORT";

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    ///
    /// Bind host of the peer server.
    ///
    #[serde(default = "Cluster::host")]
    pub host: String,
    ///
    /// Bind port of the peer server. `0` lets the system pick a free
    /// port; the advertised port follows the actual one in that case.
    ///
    #[serde(default)]
    pub port: u16,
    ///
    /// Advertised host.
    ///
    /// For the case of exposing the node behind NAT or a wildcard bind,
    /// you need to manually specify the address peers can actually
    /// reach. Defaults to the bind host.
    ///
    #[serde(default)]
    pub public_host: Option<String>,
    ///
    /// Advertised port. Defaults to the actual bound port.
    ///
    #[serde(default)]
    pub public_port: Option<u16>,
    ///
    /// Keepalive interval in seconds.
    ///
    /// Every interval a PING record is written to each peer connection;
    /// a connection that misses its acknowledgement for longer than the
    /// interval is closed.
    #[serde(default = "Cluster::ping_interval")]
    pub ping_interval: u64,
    ///
    /// Outbound connect timeout in seconds.
    ///
    #[serde(default = "Cluster::connect_timeout")]
    pub connect_timeout: u64,
    ///
    /// Maximum number of records queued towards one peer. Messages
    /// submitted beyond this are dropped, delivery is best-effort.
    ///
    #[serde(default = "Cluster::max_pending")]
    pub max_pending: usize,
}

impl Cluster {
    fn host() -> String {
        "0.0.0.0".to_string()
    }

    fn ping_interval() -> u64 {
        20
    }

    fn connect_timeout() -> u64 {
        5
    }

    fn max_pending() -> usize {
        1024
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            host: Self::host(),
            port: 0,
            public_host: None,
            public_port: None,
            ping_interval: Self::ping_interval(),
            connect_timeout: Self::connect_timeout(),
            max_pending: Self::max_pending(),
        }
    }
}

impl Cluster {
    /// The listener bind target.
    pub fn listen(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the address this node advertises to its peers: the
    /// configured public value when present, the bind value otherwise,
    /// with the actual bound port standing in for a wildcard.
    pub fn public_address(&self, actual_port: u16) -> NodeAddress {
        NodeAddress::new(
            self.public_host.clone().unwrap_or_else(|| self.host.clone()),
            self.public_port.unwrap_or(actual_port),
        )
    }
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
    pub cluster: Cluster,
    #[serde(default)]
    pub log: Log,
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
    /// Example: bus-server --config /etc/bus-server/config.json
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If the configuration file path is specified, the configuration is
    /// read from the configuration file, otherwise the default
    /// configuration is used. Environment overrides are applied last.
    ///
    pub fn load() -> Result<Self> {
        let mut config = match Cli::parse().config {
            Some(path) => serde_json5::from_str::<Self>(&read_to_string(&path)?)?,
            None => Self::default(),
        };

        config.apply_environment()?;
        Ok(config)
    }

    fn apply_environment(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var(PUBLIC_HOST_ENV) {
            self.cluster.public_host = Some(host);
        }

        if let Ok(port) = std::env::var(PUBLIC_PORT_ENV) {
            self.cluster.public_port = Some(u16::from_str(&port)?);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_address_falls_back_to_the_bind_values() {
        let cluster = Cluster {
            host: "10.0.0.1".to_string(),
            ..Cluster::default()
        };

        assert_eq!(
            cluster.public_address(54321),
            NodeAddress::new("10.0.0.1", 54321)
        );
    }

    #[test]
    fn configured_public_values_win_over_bind_values() {
        let cluster = Cluster {
            host: "0.0.0.0".to_string(),
            public_host: Some("ext.example".to_string()),
            ..Cluster::default()
        };

        // No port override: the actual bound port is advertised.
        assert_eq!(
            cluster.public_address(54321),
            NodeAddress::new("ext.example", 54321)
        );

        let cluster = Cluster {
            public_port: Some(15000),
            ..cluster
        };

        assert_eq!(
            cluster.public_address(54321),
            NodeAddress::new("ext.example", 15000)
        );
    }

    #[test]
    fn environment_overrides_the_file() {
        unsafe {
            std::env::set_var(PUBLIC_HOST_ENV, "env.example");
            std::env::set_var(PUBLIC_PORT_ENV, "19000");
        }

        let mut config = Config::default();
        config.cluster.public_host = Some("file.example".to_string());
        config.apply_environment().unwrap();

        assert_eq!(
            config.cluster.public_address(1),
            NodeAddress::new("env.example", 19000)
        );

        unsafe {
            std::env::remove_var(PUBLIC_HOST_ENV);
            std::env::remove_var(PUBLIC_PORT_ENV);
        }
    }

    #[test]
    fn config_file_round_trip() {
        let config: Config = serde_json5::from_str(
            r#"{
                cluster: {
                    host: "127.0.0.1",
                    port: 15000,
                    "public-host": "ext.example",
                    "ping-interval": 5,
                },
                log: { level: "debug" },
            }"#,
        )
        .unwrap();

        assert_eq!(config.cluster.host, "127.0.0.1");
        assert_eq!(config.cluster.port, 15000);
        assert_eq!(config.cluster.public_host.as_deref(), Some("ext.example"));
        assert_eq!(config.cluster.public_port, None);
        assert_eq!(config.cluster.ping_interval, 5);
        assert_eq!(config.cluster.max_pending, 1024);
    }
}

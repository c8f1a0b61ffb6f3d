use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Args;

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Interface traced connections arrive on; the capture socket binds to it
    pub interface: String,
    /// Address the WebSocket front-end listens on
    pub listen: SocketAddr,
    /// Highest TTL probed before a session gives up
    pub max_hops: u8,
    /// TTL of the first probe
    pub first_ttl: u8,
    /// How long each hop waits for an ICMP error or echo
    #[serde(with = "duration_serde")]
    pub hop_timeout: Duration,
    /// How often the listener evicts expired probes
    #[serde(with = "duration_serde")]
    pub reap_interval: Duration,
    /// Append-only JSON-lines result log
    pub logfile: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_hops: 30,
            first_ttl: 1,
            hop_timeout: Duration::from_millis(1200),
            reap_interval: Duration::from_secs(1),
            logfile: PathBuf::from("logFile.jsonl"),
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            interface: args.interface.clone(),
            listen: args.listen,
            max_hops: args.max_hops,
            first_ttl: args.first_ttl,
            hop_timeout: args.timeout_duration(),
            reap_interval: args.reap_interval_duration(),
            logfile: args.logfile.clone(),
        }
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_hops, 30);
        assert_eq!(config.first_ttl, 1);
        assert_eq!(config.hop_timeout, Duration::from_millis(1200));
    }

    #[test]
    fn test_from_args() {
        let args = Args::parse_from([
            "zerotrace",
            "--interface",
            "ens3",
            "--max-hops",
            "12",
            "--timeout",
            "0.5",
        ]);
        let config = Config::from(&args);
        assert_eq!(config.interface, "ens3");
        assert_eq!(config.max_hops, 12);
        assert_eq!(config.hop_timeout, Duration::from_millis(500));
        assert_eq!(config.logfile, PathBuf::from("logFile.jsonl"));
    }

    #[test]
    fn test_serde_durations_as_seconds() {
        let config = Config {
            hop_timeout: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["hop_timeout"], 1.5);

        let back: Config = serde_json::from_value(json).unwrap();
        assert_eq!(back.hop_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let mut json = serde_json::to_value(Config::default()).unwrap();
        json["hop_timeout"] = serde_json::json!(-1.0);
        assert!(serde_json::from_value::<Config>(json).is_err());
    }
}

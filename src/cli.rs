use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Blind in-connection traceroute (0trace) service for VPN detection
#[derive(Parser, Debug, Clone)]
#[command(name = "zerotrace")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to accept WebSocket connections on
    #[arg(short = 'l', long = "listen", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Interface client connections arrive on (ICMP replies are captured here)
    #[arg(short = 'i', long = "interface", default_value = "eth0")]
    pub interface: String,

    /// Maximum TTL (hops) probed per session
    #[arg(short = 'm', long = "max-hops", default_value = "30")]
    pub max_hops: u8,

    /// TTL of the first probe
    #[arg(long = "first-ttl", default_value = "1")]
    pub first_ttl: u8,

    /// Per-hop timeout in seconds
    #[arg(long = "timeout", default_value = "1.2")]
    pub timeout: f64,

    /// Interval in seconds between sweeps of expired probes
    #[arg(long = "reap-interval", default_value = "1.0")]
    pub reap_interval: f64,

    /// Append-only JSON-lines result log
    #[arg(long = "logfile", default_value = "logFile.jsonl")]
    pub logfile: PathBuf,

    /// Diagnostic log filter (overridden by RUST_LOG)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Get timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// Get reap interval as Duration
    pub fn reap_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.reap_interval)
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout.is_nan() || self.timeout <= 0.0 {
            return Err("Timeout must be positive".into());
        }
        const MAX_TIMEOUT_SECS: f64 = 60.0;
        if self.timeout > MAX_TIMEOUT_SECS {
            return Err(format!("Timeout cannot exceed {} seconds", MAX_TIMEOUT_SECS));
        }

        if self.reap_interval.is_nan()
            || self.reap_interval <= 0.0
            || self.reap_interval > MAX_TIMEOUT_SECS
        {
            return Err("Reap interval must be between 0 and 60 seconds".into());
        }

        if self.max_hops == 0 {
            return Err("Max hops must be at least 1".into());
        }

        // Every hop may cost a full timeout on a live client connection
        const MAX_SAFE_HOPS: u8 = 64;
        if self.max_hops > MAX_SAFE_HOPS {
            return Err(format!("Max hops cannot exceed {}", MAX_SAFE_HOPS));
        }

        if self.first_ttl == 0 {
            return Err("First TTL must be at least 1".into());
        }
        if self.first_ttl > self.max_hops {
            return Err(format!(
                "First TTL ({}) cannot exceed max hops ({})",
                self.first_ttl, self.max_hops
            ));
        }

        if self.interface.is_empty() {
            return Err("Interface name cannot be empty".into());
        }
        // IFNAMSIZ on Linux is 16 including null terminator
        if self.interface.len() > 15 {
            return Err(format!(
                "Interface name too long: {} (max 15 chars)",
                self.interface
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["zerotrace"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults_are_valid() {
        let args = parse(&[]);
        assert_eq!(args.max_hops, 30);
        assert!((args.timeout_duration().as_secs_f64() - 1.2).abs() < 1e-6);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_hop_bounds() {
        assert!(parse(&["-m", "0"]).validate().is_err());
        assert!(parse(&["-m", "64"]).validate().is_ok());
        assert!(parse(&["-m", "65"]).validate().is_err());
    }

    #[test]
    fn test_first_ttl_must_fit_under_ceiling() {
        assert!(parse(&["-m", "5", "--first-ttl", "5"]).validate().is_ok());
        let err = parse(&["-m", "5", "--first-ttl", "6"]).validate().unwrap_err();
        assert!(err.contains("First TTL"));
        assert!(parse(&["--first-ttl", "0"]).validate().is_err());
    }

    #[test]
    fn test_timeout_bounds() {
        assert!(parse(&["--timeout", "0"]).validate().is_err());
        assert!(parse(&["--timeout", "NaN"]).validate().is_err());
        assert!(parse(&["--timeout", "61"]).validate().is_err());
    }

    #[test]
    fn test_interface_name_length() {
        assert!(parse(&["-i", ""]).validate().is_err());
        assert!(parse(&["-i", "averyveryverylongname"]).validate().is_err());
    }
}

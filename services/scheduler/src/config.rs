use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use shepherd_id::HostId;
use shepherd_reconcile::{BackoffPolicy, DEFAULT_SYNC_INTERVAL};

use crate::listener::ListenerConfig;
use crate::records::Host;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub sync_interval: Duration,
    pub retry_base: Duration,
    pub shutdown_timeout: Duration,
    /// Hosts registered at startup, from `SHEPHERD_HOSTS`.
    pub hosts: Vec<Host>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("SHEPHERD_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("SHEPHERD_LISTEN_ADDR")?;

        let log_level = std::env::var("SHEPHERD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let sync_interval =
            secs_var("SHEPHERD_SYNC_INTERVAL_SECS")?.unwrap_or(DEFAULT_SYNC_INTERVAL);
        if sync_interval.is_zero() {
            bail!("SHEPHERD_SYNC_INTERVAL_SECS must be positive");
        }

        let retry_base = match std::env::var("SHEPHERD_RETRY_BASE_MS") {
            Ok(v) => Duration::from_millis(v.parse().context("SHEPHERD_RETRY_BASE_MS")?),
            Err(_) => BackoffPolicy::default().base,
        };

        let shutdown_timeout =
            secs_var("SHEPHERD_SHUTDOWN_TIMEOUT_SECS")?.unwrap_or(Duration::from_secs(10));

        let hosts = match std::env::var("SHEPHERD_HOSTS") {
            Ok(v) => parse_hosts(&v).context("SHEPHERD_HOSTS")?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            listen_addr,
            log_level,
            sync_interval,
            retry_base,
            shutdown_timeout,
            hosts,
        })
    }

    pub fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            sync_interval: self.sync_interval,
            backoff: BackoffPolicy {
                base: self.retry_base,
                ..BackoffPolicy::default()
            },
        }
    }
}

fn secs_var(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(v) => {
            let secs: u64 = v
                .parse()
                .with_context(|| format!("{name} must be a number of seconds"))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

/// Parse a comma-separated list of `id=ip` pairs.
pub fn parse_hosts(value: &str) -> Result<Vec<Host>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let Some((id, ip)) = entry.split_once('=') else {
                bail!("expected id=ip, got '{entry}'");
            };
            let ip_addr: std::net::IpAddr = ip
                .trim()
                .parse()
                .with_context(|| format!("invalid address for host {id}"))?;
            Ok(Host {
                id: HostId::parse(id.trim()).with_context(|| format!("invalid host id '{id}'"))?,
                ip_addr: ip_addr.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_hosts() {
        let hosts = parse_hosts("host-1=10.0.0.1, host-2 = 10.0.0.2,").unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].id.as_str(), "host-1");
        assert_eq!(hosts[1].ip_addr, "10.0.0.2");
    }

    #[test]
    fn test_parse_hosts_empty() {
        assert!(parse_hosts("").unwrap().is_empty());
    }

    #[rstest]
    #[case("host-1")]
    #[case("host-1=not-an-ip")]
    #[case("bad/id=10.0.0.1")]
    fn test_parse_hosts_rejects(#[case] value: &str) {
        assert!(parse_hosts(value).is_err());
    }
}

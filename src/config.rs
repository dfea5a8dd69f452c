use std::env;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::{ProxyError, Result};
use crate::proxy::resolver::DNS_PORT;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy listener configuration
    pub proxy: ProxyServerConfig,
    /// Egress path pinning
    pub egress: EgressConfig,
    /// Client-facing interface used for status output
    pub local_edge: LocalEdgeConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy listener (default: 8080)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Egress dial timeout in seconds
    pub connect_timeout: u64,
    /// Chunk size for each relay direction
    pub relay_buffer_size: usize,
    /// Longest request line accepted from a client
    pub max_request_line: usize,
    /// Drop the header block that follows a CONNECT line instead of relaying it
    pub skip_tunnel_headers: bool,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            connect_timeout: 10,
            relay_buffer_size: 8192,
            max_request_line: 8192,
            skip_tunnel_headers: false,
        }
    }
}

impl ProxyServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressConfig {
    /// Interface that egress sockets are pinned to (monitored for loss)
    pub interface: Option<String>,
    /// Source address that egress sockets bind to
    pub source_addr: Option<IpAddr>,
    /// How often the interface monitor re-reads the interface table
    pub poll_interval: Duration,
    /// Name servers queried over the egress path
    pub dns_servers: Vec<SocketAddr>,
    /// Per-server query timeout
    pub dns_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LocalEdgeConfig {
    /// Substring matched against interface names (default: wlan)
    pub interface_hint: String,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let proxy = ProxyServerConfig {
            port: get_or("PROXY_PORT", "8080").parse().map_err(|_| {
                ProxyError::InvalidConfig("PROXY_PORT must be a valid port number".into())
            })?,
            host: get_or("PROXY_HOST", "0.0.0.0"),
            connect_timeout: get_or("PROXY_CONNECT_TIMEOUT", "10").parse().map_err(|_| {
                ProxyError::InvalidConfig("PROXY_CONNECT_TIMEOUT must be a number of seconds".into())
            })?,
            relay_buffer_size: parse_nonzero(&get_or("PROXY_RELAY_BUFFER_SIZE", "8192"))
                .ok_or_else(|| {
                    ProxyError::InvalidConfig(
                        "PROXY_RELAY_BUFFER_SIZE must be a positive number".into(),
                    )
                })?,
            max_request_line: parse_nonzero(&get_or("PROXY_MAX_REQUEST_LINE", "8192"))
                .ok_or_else(|| {
                    ProxyError::InvalidConfig(
                        "PROXY_MAX_REQUEST_LINE must be a positive number".into(),
                    )
                })?,
            skip_tunnel_headers: get_or("PROXY_TUNNEL_SKIP_HEADERS", "false")
                .parse()
                .unwrap_or(false),
        };

        let interface = lookup("EGRESS_INTERFACE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let source_addr = match lookup("EGRESS_SOURCE_ADDR").filter(|s| !s.trim().is_empty()) {
            Some(raw) => Some(raw.trim().parse::<IpAddr>().map_err(|_| {
                ProxyError::InvalidConfig(format!(
                    "EGRESS_SOURCE_ADDR must be an IP address, got '{}'",
                    raw
                ))
            })?),
            None => None,
        };

        if interface.is_none() && source_addr.is_none() {
            return Err(ProxyError::InvalidConfig(
                "EGRESS_INTERFACE or EGRESS_SOURCE_ADDR must be set; traffic is never sent over the default route".into(),
            ));
        }

        let poll_interval_ms: u64 = get_or("EGRESS_POLL_INTERVAL_MS", "1000")
            .parse()
            .unwrap_or(1000);

        let dns_servers = parse_name_servers(&get_or("EGRESS_DNS_SERVERS", "1.1.1.1,8.8.8.8"))?;
        let dns_timeout_ms: u64 = get_or("EGRESS_DNS_TIMEOUT_MS", "3000").parse().map_err(|_| {
            ProxyError::InvalidConfig("EGRESS_DNS_TIMEOUT_MS must be a number of milliseconds".into())
        })?;

        Ok(Config {
            proxy,
            egress: EgressConfig {
                interface,
                source_addr,
                poll_interval: Duration::from_millis(poll_interval_ms.max(50)),
                dns_servers,
                dns_timeout: Duration::from_millis(dns_timeout_ms.max(1)),
            },
            local_edge: LocalEdgeConfig {
                interface_hint: get_or("LOCAL_EDGE_INTERFACE", "wlan"),
            },
            log: LogConfig {
                level: get_or("LOG_LEVEL", "info"),
                format: get_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the proxy listener address
    pub fn proxy_addr(&self) -> String {
        self.proxy.listen_addr()
    }
}

/// Comma-separated `ip` or `ip:port` entries; bare addresses use port 53
fn parse_name_servers(value: &str) -> Result<Vec<SocketAddr>> {
    let servers = value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<SocketAddr>()
                .or_else(|_| entry.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DNS_PORT)))
                .map_err(|_| {
                    ProxyError::InvalidConfig(format!(
                        "EGRESS_DNS_SERVERS entry '{}' is not an IP address",
                        entry
                    ))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    if servers.is_empty() {
        return Err(ProxyError::InvalidConfig(
            "EGRESS_DNS_SERVERS must name at least one server".into(),
        ));
    }
    Ok(servers)
}

fn parse_nonzero(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_interface_is_set() {
        let config = load(&[("EGRESS_INTERFACE", "rmnet0")]).unwrap();

        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.proxy.host, "0.0.0.0");
        assert_eq!(config.proxy.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.proxy.relay_buffer_size, 8192);
        assert_eq!(config.proxy.max_request_line, 8192);
        assert!(!config.proxy.skip_tunnel_headers);
        assert_eq!(config.egress.interface.as_deref(), Some("rmnet0"));
        assert_eq!(config.egress.source_addr, None);
        assert_eq!(config.egress.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.local_edge.interface_hint, "wlan");
        assert_eq!(
            config.egress.dns_servers,
            vec![
                "1.1.1.1:53".parse::<SocketAddr>().unwrap(),
                "8.8.8.8:53".parse().unwrap()
            ]
        );
        assert_eq!(config.egress.dns_timeout, Duration::from_secs(3));
        assert_eq!(config.proxy_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn rejects_missing_egress_pin() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidConfig(_)));

        let err = load(&[("EGRESS_INTERFACE", "  ")]).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidConfig(_)));
    }

    #[test]
    fn parses_source_addr() {
        let config = load(&[("EGRESS_SOURCE_ADDR", "10.0.0.7")]).unwrap();
        assert_eq!(config.egress.source_addr, Some("10.0.0.7".parse().unwrap()));

        let err = load(&[("EGRESS_SOURCE_ADDR", "not-an-ip")]).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_invalid_numbers() {
        let err = load(&[("EGRESS_INTERFACE", "wwan0"), ("PROXY_PORT", "99999")]).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidConfig(_)));

        let err = load(&[
            ("EGRESS_INTERFACE", "wwan0"),
            ("PROXY_RELAY_BUFFER_SIZE", "0"),
        ])
        .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidConfig(_)));
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let config = load(&[
            ("EGRESS_INTERFACE", "wwan0"),
            ("EGRESS_POLL_INTERVAL_MS", "1"),
        ])
        .unwrap();
        assert_eq!(config.egress.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn parses_name_servers() {
        let config = load(&[
            ("EGRESS_INTERFACE", "wwan0"),
            ("EGRESS_DNS_SERVERS", " 10.0.0.1 , [2001:db8::53]:5353,9.9.9.9:853"),
        ])
        .unwrap();
        assert_eq!(
            config.egress.dns_servers,
            vec![
                "10.0.0.1:53".parse::<SocketAddr>().unwrap(),
                "[2001:db8::53]:5353".parse().unwrap(),
                "9.9.9.9:853".parse().unwrap(),
            ]
        );

        for bad in ["dns.example", ",", ""] {
            let err = load(&[("EGRESS_INTERFACE", "wwan0"), ("EGRESS_DNS_SERVERS", bad)]).unwrap_err();
            assert!(matches!(err, ProxyError::InvalidConfig(_)), "accepted {:?}", bad);
        }
    }
}

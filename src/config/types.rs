//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Default health check settings
    #[serde(default)]
    pub health_check_defaults: HealthCheckDefaults,

    /// Cluster definitions (backend pools)
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    /// Frontend definitions (where we listen)
    #[serde(default)]
    pub frontends: Vec<FrontendConfig>,
}

impl Config {
    /// Look up a cluster definition by name.
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Default health check settings, overridable per cluster.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckDefaults {
    /// How often to probe each node
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for a single probe
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive failures before marking a node BAD. The default of 1
    /// makes every failed probe decisive.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Consecutive successes before marking a node GOOD (default 1)
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

impl Default for HealthCheckDefaults {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

/// Cluster (backend pool) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Unique name for this cluster
    pub name: String,

    /// Load balancing algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Session persistence
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Health check for every node of this cluster
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Backend nodes
    pub nodes: Vec<NodeConfig>,
}

/// Individual node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Node address and port
    pub address: SocketAddr,

    /// Weight for weighted load balancing (default: 1)
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Connection cap; -1 or 0 for unlimited (default: -1)
    #[serde(default = "default_max_connections")]
    pub max_connections: i64,
}

impl NodeConfig {
    /// A node with default weight and no connection cap.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            weight: default_weight(),
            max_connections: default_max_connections(),
        }
    }
}

/// Load balancing algorithm.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
    LeastLoad,
    #[serde(alias = "weighted")]
    WeightedRoundRobin,
    WeightedRandom,
    WeightedLeastConnections,
    #[serde(alias = "ip_hash")]
    SourceIpHash,
}

/// What a session persistence mapping is keyed on.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    #[default]
    None,
    SourceIp,
    FourTuple,
    Cookie,
}

/// Session persistence configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PersistenceConfig {
    /// Key for the mapping
    #[serde(default)]
    pub mode: PersistenceMode,

    /// How long an unused mapping is kept
    #[serde(default = "default_persistence_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Most mappings kept at once
    #[serde(default = "default_persistence_capacity")]
    pub capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            mode: PersistenceMode::None,
            ttl: default_persistence_ttl(),
            capacity: default_persistence_capacity(),
        }
    }
}

/// Health check configuration; unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Type of health check: tcp or http
    #[serde(default, rename = "type")]
    pub check_type: HealthCheckType,

    /// HTTP path to request (for HTTP health checks)
    #[serde(default)]
    pub path: Option<String>,

    /// Override interval for this cluster
    #[serde(default, with = "option_humantime_serde")]
    pub interval: Option<Duration>,

    /// Override timeout for this cluster
    #[serde(default, with = "option_humantime_serde")]
    pub timeout: Option<Duration>,

    /// Override failure threshold for this cluster
    #[serde(default)]
    pub unhealthy_threshold: Option<u32>,

    /// Override success threshold for this cluster
    #[serde(default)]
    pub healthy_threshold: Option<u32>,
}

impl HealthCheckConfig {
    /// Fill unset fields from `defaults`.
    pub fn resolve(&self, defaults: &HealthCheckDefaults) -> HealthCheckSettings {
        let kind = match self.check_type {
            HealthCheckType::Tcp => ProbeKind::Tcp,
            HealthCheckType::Http => ProbeKind::Http {
                path: self.path.clone().unwrap_or_else(|| "/".to_string()),
            },
        };
        HealthCheckSettings {
            kind,
            interval: self.interval.unwrap_or(defaults.interval),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            unhealthy_threshold: self
                .unhealthy_threshold
                .unwrap_or(defaults.unhealthy_threshold),
            healthy_threshold: self.healthy_threshold.unwrap_or(defaults.healthy_threshold),
        }
    }
}

/// Type of health check.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    #[default]
    Tcp,
    Http,
}

/// What a probe does against a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    /// Open a TCP connection.
    Tcp,
    /// Issue `GET path` and expect a 2xx status.
    Http { path: String },
}

/// Fully resolved health check settings for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSettings {
    pub kind: ProbeKind,
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        HealthCheckConfig::default().resolve(&HealthCheckDefaults::default())
    }
}

/// Frontend configuration (listener).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrontendConfig {
    /// Unique name for this frontend
    pub name: String,

    /// Address and port to listen on
    pub listen: SocketAddr,

    /// Protocol: tcp or udp
    #[serde(default)]
    pub protocol: Protocol,

    /// Name of the cluster to route to
    pub cluster: String,

    /// TCP-specific settings
    #[serde(default)]
    pub tcp: Option<TcpConfig>,

    /// UDP-specific settings
    #[serde(default)]
    pub udp: Option<UdpConfig>,
}

/// Protocol type.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// TCP-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpConfig {
    /// Connection timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// UDP-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpConfig {
    /// Datagrams buffered per flow while its backend connect is pending
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,

    /// Flows idle for longer than this are reaped
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// How often the reaper scans the flow table
    #[serde(default = "default_reap_interval", with = "humantime_serde")]
    pub reap_interval: Duration,

    /// Backend connect timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            backlog_limit: default_backlog_limit(),
            idle_timeout: default_idle_timeout(),
            reap_interval: default_reap_interval(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_unhealthy_threshold() -> u32 {
    1
}

fn default_healthy_threshold() -> u32 {
    1
}

fn default_persistence_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_persistence_capacity() -> usize {
    100_000
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_backlog_limit() -> usize {
    64
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> i64 {
    -1
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Custom serde module for optional humantime durations.
mod option_humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                let s = humantime::format_duration(*d).to_string();
                serializer.serialize_some(&s)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config {
            global: GlobalConfig::default(),
            health_check_defaults: HealthCheckDefaults::default(),
            clusters: vec![],
            frontends: vec![],
        };
        assert_eq!(config.global.log_level, "info");
        assert!(config.cluster("web").is_none());
    }

    #[test]
    fn test_algorithm_serde() {
        let algo: Algorithm = serde_yaml::from_str("round_robin").unwrap();
        assert_eq!(algo, Algorithm::RoundRobin);

        let algo: Algorithm = serde_yaml::from_str("least_connections").unwrap();
        assert_eq!(algo, Algorithm::LeastConnections);

        let algo: Algorithm = serde_yaml::from_str("weighted").unwrap();
        assert_eq!(algo, Algorithm::WeightedRoundRobin);

        let algo: Algorithm = serde_yaml::from_str("ip_hash").unwrap();
        assert_eq!(algo, Algorithm::SourceIpHash);
    }

    #[test]
    fn test_node_defaults() {
        let node: NodeConfig = serde_yaml::from_str("address: \"10.0.0.1:80\"").unwrap();
        assert_eq!(node, NodeConfig::new("10.0.0.1:80".parse().unwrap()));
        assert_eq!(node.weight, 1);
        assert_eq!(node.max_connections, -1);
    }

    #[test]
    fn test_health_check_resolve() {
        let defaults = HealthCheckDefaults::default();
        let config: HealthCheckConfig =
            serde_yaml::from_str("type: http\npath: /healthz\ninterval: 2s\nhealthy_threshold: 1")
                .unwrap();

        let settings = config.resolve(&defaults);
        assert_eq!(
            settings.kind,
            ProbeKind::Http {
                path: "/healthz".to_string()
            }
        );
        assert_eq!(settings.interval, Duration::from_secs(2));
        assert_eq!(settings.timeout, defaults.timeout);
        assert_eq!(settings.healthy_threshold, 1);
        assert_eq!(settings.unhealthy_threshold, defaults.unhealthy_threshold);
    }

    #[test]
    fn test_persistence_serde() {
        let config: PersistenceConfig =
            serde_yaml::from_str("mode: four_tuple\nttl: 30s").unwrap();
        assert_eq!(config.mode, PersistenceMode::FourTuple);
        assert_eq!(config.ttl, Duration::from_secs(30));
        assert_eq!(config.capacity, 100_000);
    }
}

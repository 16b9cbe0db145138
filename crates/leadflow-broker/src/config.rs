//! Broker configuration.

use crate::retry::RetryConfig;

/// Connection settings for the shared broker.
///
/// Clustered mode is selected by a non-empty `cluster_nodes` list; the
/// host/port fields are ignored in that case.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker host (standalone mode)
    pub host: String,
    /// Broker port (standalone mode)
    pub port: u16,
    /// Optional username
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Use TLS (`rediss://`)
    pub tls: bool,
    /// Cluster node URLs; non-empty enables clustered mode
    pub cluster_nodes: Vec<String>,
    /// Max cluster redirections before an operation fails
    pub max_redirections: u32,
    /// Route reads to replicas in clustered mode
    pub read_from_replicas: bool,
    /// Reconnect/backoff strategy for establishing the connection
    pub retry: RetryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            tls: false,
            cluster_nodes: Vec::new(),
            max_redirections: 3,
            read_from_replicas: false,
            retry: RetryConfig::new("broker_connect").with_max_retries(5),
        }
    }
}

impl BrokerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("BROKER_HOST").unwrap_or(defaults.host),
            port: std::env::var("BROKER_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            username: std::env::var("BROKER_USERNAME").ok(),
            password: std::env::var("BROKER_PASSWORD").ok(),
            tls: std::env::var("BROKER_TLS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cluster_nodes: std::env::var("BROKER_CLUSTER_NODES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            max_redirections: std::env::var("BROKER_MAX_REDIRECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_redirections),
            read_from_replicas: std::env::var("BROKER_READ_FROM_REPLICAS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            retry: defaults.retry,
        }
    }

    /// True when a node list was provided.
    pub fn is_cluster(&self) -> bool {
        !self.cluster_nodes.is_empty()
    }

    /// Connection URL for standalone mode.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (None, Some(pass)) => format!(":{}@", pass),
            _ => String::new(),
        };
        format!("{}://{}{}:{}", scheme, auth, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_without_auth() {
        let config = BrokerConfig::default();
        assert_eq!(config.url(), "redis://localhost:6379");
    }

    #[test]
    fn url_with_password_and_tls() {
        let config = BrokerConfig {
            password: Some("hunter2".to_string()),
            tls: true,
            ..Default::default()
        };
        assert_eq!(config.url(), "rediss://:hunter2@localhost:6379");
    }

    #[test]
    fn cluster_mode_from_node_list() {
        let mut config = BrokerConfig::default();
        assert!(!config.is_cluster());
        config.cluster_nodes = vec!["redis://n1:6379".to_string()];
        assert!(config.is_cluster());
    }
}

use crate::utils::error::{Result, RustBalanceError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub pacemaker: Option<PacemakerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    #[serde(rename = "type", default = "default_upstream_type")]
    pub kind: String,
    /// Peer addresses for static pools; the single group identifier
    /// for autoscaling pools.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(rename = "bind", default = "default_bind_address")]
    pub address: String,
    pub port: u16,
    #[serde(rename = "proto", default = "default_protocol")]
    pub protocol: String,
    /// Upstream name, `upstream:port`, or a fixed `host:port` target.
    pub pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacemakerConfig {
    pub region: String,
    /// Seconds between heartbeats.
    #[serde(default = "default_pacemaker_interval")]
    pub interval: u64,
    pub namespace: String,
    pub metric: String,
    #[serde(default)]
    pub dimension_value: Option<String>,
}

// Default values
fn default_upstream_type() -> String {
    "static".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_protocol() -> String {
    "udp".to_string()
}

fn default_pacemaker_interval() -> u64 {
    60
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| RustBalanceError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| RustBalanceError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for upstream in &self.upstreams {
            if upstream.name.is_empty() {
                return Err(RustBalanceError::Config(
                    "upstream name cannot be empty".to_string(),
                ));
            }
            if !names.insert(upstream.name.as_str()) {
                return Err(RustBalanceError::Config(format!(
                    "duplicate upstream name: {}",
                    upstream.name
                )));
            }
        }

        for server in &self.servers {
            // Only UDP balancing is implemented.
            if server.protocol != "udp" {
                return Err(RustBalanceError::Config(format!(
                    "unsupported proto '{}' for listener {}:{}",
                    server.protocol, server.address, server.port
                )));
            }
            if server.pass.is_empty() {
                return Err(RustBalanceError::Config(format!(
                    "listener {}:{} has no pass target",
                    server.address, server.port
                )));
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"upstreams:
  - name: backends
    targets:
      - "10.0.0.1:9000"
      - "10.0.0.2:9000"
    hash: remote_ip  # Options: none, remote_ip, remote_port

  # For an AWS autoscaling group (requires AWS_REGION in the
  # environment), targets holds the single group name:
  # - name: workers
  #   type: aws_autoscaling_group
  #   targets:
  #     - my-autoscaling-group
  #   hash: remote_ip

servers:
  - bind: "0.0.0.0"
    port: 5000
    proto: udp
    pass: backends

# Optional CloudWatch heartbeat:
# pacemaker:
#   region: eu-west-1
#   interval: 60
#   namespace: RustBalance
#   metric: Heartbeat
#   dimension_value: i-0123456789abcdef0  # defaults to the instance id
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            RustBalanceError::Config(format!("Failed to write example config: {}", e))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn parse_full_config() {
        let config = parse(
            r#"
upstreams:
  - name: backends
    targets: ["10.0.0.1:9000", "10.0.0.2:9000"]
    hash: remote_ip
servers:
  - bind: "0.0.0.0"
    port: 5000
    proto: udp
    pass: backends
pacemaker:
  region: eu-west-1
  interval: 30
  namespace: RustBalance
  metric: Heartbeat
"#,
        );

        assert_eq!(config.upstreams.len(), 1);
        assert_eq!(config.upstreams[0].name, "backends");
        assert_eq!(config.upstreams[0].kind, "static");
        assert_eq!(config.upstreams[0].targets.len(), 2);
        assert_eq!(config.upstreams[0].hash, "remote_ip");

        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].port, 5000);
        assert_eq!(config.servers[0].pass, "backends");

        let pacemaker = config.pacemaker.unwrap();
        assert_eq!(pacemaker.region, "eu-west-1");
        assert_eq!(pacemaker.interval, 30);
        assert!(pacemaker.dimension_value.is_none());
    }

    #[test]
    fn defaults_applied() {
        let config = parse(
            r#"
upstreams:
  - name: u
servers:
  - port: 5000
    pass: u
"#,
        );

        assert_eq!(config.upstreams[0].kind, "static");
        assert!(config.upstreams[0].targets.is_empty());
        assert_eq!(config.upstreams[0].hash, "");
        assert_eq!(config.servers[0].address, "0.0.0.0");
        assert_eq!(config.servers[0].protocol, "udp");
        assert!(config.pacemaker.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_upstream_names_rejected() {
        let config = parse(
            r#"
upstreams:
  - name: u
  - name: u
"#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_udp_proto_rejected() {
        let config = parse(
            r#"
servers:
  - port: 5000
    proto: tcp
    pass: somewhere
"#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_pass_rejected() {
        let config = parse(
            r#"
servers:
  - port: 5000
    pass: ""
"#,
        );
        assert!(config.validate().is_err());
    }
}

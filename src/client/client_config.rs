use std::time::Duration;

use anyhow::bail;

use crate::topic::endpoint::Endpoint;
use crate::topic::names::resolve_name;
use crate::wire::frame::DEFAULT_MAX_FRAME_LEN;

pub const ENV_MASTER_URI: &str = "ROS_MASTER_URI";
pub const ENV_HOSTNAME: &str = "ROS_HOSTNAME";
pub const ENV_IP: &str = "ROS_IP";

pub const DEFAULT_MASTER_URI: &str = "http://localhost:11311/";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// the node name, used as party identity in registry calls and handshakes
    pub caller_id: String,
    pub master_addr: Endpoint,

    /// the host name that is written into this client's node URI and into streaming endpoints
    ///  handed out to subscribers - it must be reachable for peers
    pub advertised_host: String,
    pub bind_host: String,
    /// 0 for an ephemeral port
    pub rpc_port: u16,
    pub rpc_timeout: Duration,

    /// ceiling for queued-but-unsent bytes per outbound connection
    pub max_queue_size_bytes: usize,
    /// number of most recent messages that are never dropped, even if they exceed the ceiling
    pub min_retained_messages: usize,
    pub max_frame_len: usize,

    pub sender_accept_timeout: Duration,
    /// number of consecutive failed accept / handshake rounds after which a sender gives up
    pub sender_accept_rounds: u32,

    pub receiver_connect_timeout: Duration,
    pub receiver_reconnect_backoff: Duration,
    pub receiver_max_connect_attempts: u32,

    pub dispose_timeout: Duration,
    pub cleanup_interval: Duration,
    /// for connection count queries: if a manager is busy for longer than this, the last known
    ///  count is reported
    pub connection_count_lock_timeout: Duration,
}

impl ClientConfig {
    pub fn new(caller_id: &str, master_addr: Endpoint) -> ClientConfig {
        ClientConfig {
            caller_id: caller_id.to_string(),
            master_addr,
            advertised_host: "127.0.0.1".to_string(),
            bind_host: "0.0.0.0".to_string(),
            rpc_port: 0,
            rpc_timeout: Duration::from_secs(3),
            max_queue_size_bytes: 64*1024,
            min_retained_messages: 2,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            sender_accept_timeout: Duration::from_secs(5),
            sender_accept_rounds: 3,
            receiver_connect_timeout: Duration::from_secs(5),
            receiver_reconnect_backoff: Duration::from_secs(2),
            receiver_max_connect_attempts: 5,
            dispose_timeout: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(5),
            connection_count_lock_timeout: Duration::from_millis(20),
        }
    }

    /// Takes the registry address from `ROS_MASTER_URI` and the advertised host from
    ///  `ROS_HOSTNAME` or (with lower precedence) `ROS_IP`.
    pub fn from_env(caller_id: &str) -> anyhow::Result<ClientConfig> {
        Self::from_vars(caller_id, |key| std::env::var(key).ok())
    }

    fn from_vars(caller_id: &str, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<ClientConfig> {
        let master_uri = lookup(ENV_MASTER_URI)
            .unwrap_or_else(|| DEFAULT_MASTER_URI.to_string());

        let mut result = Self::new(caller_id, Endpoint::parse_uri(&master_uri)?);
        if let Some(host) = lookup(ENV_HOSTNAME).or_else(|| lookup(ENV_IP)) {
            result.advertised_host = host;
        }
        Ok(result)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        resolve_name(&self.caller_id)?;
        if self.advertised_host.is_empty() {
            bail!("advertised host must not be empty");
        }
        if self.max_queue_size_bytes == 0 {
            bail!("max queue size must be positive");
        }
        if self.max_frame_len < 1024 {
            bail!("max frame length is too small");
        }
        if self.sender_accept_rounds == 0 || self.receiver_max_connect_attempts == 0 {
            bail!("retry budgets must allow at least one attempt");
        }
        if self.rpc_timeout.is_zero() || self.sender_accept_timeout.is_zero() || self.receiver_connect_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        if self.cleanup_interval.is_zero() {
            bail!("cleanup interval must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new("/viz", Endpoint::new("localhost", 11311))
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(config().validate().is_ok());
    }

    #[rstest]
    #[case::caller_id(|c: &mut ClientConfig| c.caller_id = "/not valid".to_string())]
    #[case::host(|c: &mut ClientConfig| c.advertised_host.clear())]
    #[case::queue(|c: &mut ClientConfig| c.max_queue_size_bytes = 0)]
    #[case::frame_len(|c: &mut ClientConfig| c.max_frame_len = 10)]
    #[case::accept_rounds(|c: &mut ClientConfig| c.sender_accept_rounds = 0)]
    #[case::connect_attempts(|c: &mut ClientConfig| c.receiver_max_connect_attempts = 0)]
    #[case::rpc_timeout(|c: &mut ClientConfig| c.rpc_timeout = Duration::ZERO)]
    #[case::cleanup(|c: &mut ClientConfig| c.cleanup_interval = Duration::ZERO)]
    fn test_validate_rejects(#[case] modify: fn(&mut ClientConfig)) {
        let mut config = config();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::nothing_set(None, None, None, "localhost", 11311, "127.0.0.1")]
    #[case::master(Some("http://master:1234/"), None, None, "master", 1234, "127.0.0.1")]
    #[case::ip(None, None, Some("10.0.0.5"), "localhost", 11311, "10.0.0.5")]
    #[case::hostname_wins(None, Some("viz-box"), Some("10.0.0.5"), "localhost", 11311, "viz-box")]
    fn test_from_vars(
        #[case] master_uri: Option<&str>,
        #[case] hostname: Option<&str>,
        #[case] ip: Option<&str>,
        #[case] expected_master_host: &str,
        #[case] expected_master_port: u16,
        #[case] expected_advertised: &str,
    ) {
        let config = ClientConfig::from_vars("/viz", |key| match key {
            ENV_MASTER_URI => master_uri.map(|s| s.to_string()),
            ENV_HOSTNAME => hostname.map(|s| s.to_string()),
            ENV_IP => ip.map(|s| s.to_string()),
            _ => None,
        }).unwrap();

        assert_eq!(config.master_addr, Endpoint::new(expected_master_host, expected_master_port));
        assert_eq!(config.advertised_host, expected_advertised);
    }

    #[test]
    fn test_from_vars_rejects_bad_master_uri() {
        assert!(ClientConfig::from_vars("/viz", |_| Some("no-port".to_string())).is_err());
    }
}

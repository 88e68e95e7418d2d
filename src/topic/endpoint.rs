use std::fmt::{Debug, Display, Formatter};

use anyhow::{anyhow, bail};

/// A TCP peer, identified by host name (or IP literal) and port. Immutable value type.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
}

impl Endpoint {
    pub const URI_SCHEME: &'static str = "http";

    pub fn new(hostname: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            hostname: hostname.into(),
            port,
        }
    }

    /// The node URI under which a local RPC server listening on this endpoint is advertised
    pub fn to_uri(&self) -> String {
        format!("{}://{}/", Self::URI_SCHEME, self.socket_addr_string())
    }

    /// Accepts `scheme://host:port[/path]` for any scheme, and bare `host:port`.
    pub fn parse_uri(uri: &str) -> anyhow::Result<Endpoint> {
        let without_scheme = match uri.split_once("://") {
            Some((_, rest)) => rest,
            None => uri,
        };
        let authority = without_scheme.split('/').next().unwrap_or_default();

        let (host, port) = authority.rsplit_once(':')
            .ok_or_else(|| anyhow!("URI {:?} has no port", uri))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            bail!("URI {:?} has no host", uri);
        }
        let port = port.parse::<u16>()
            .map_err(|e| anyhow!("URI {:?} has an invalid port: {}", uri, e))?;

        Ok(Endpoint::new(host, port))
    }

    pub fn socket_addr_string(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.port)
        }
        else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.hostname, self.port)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

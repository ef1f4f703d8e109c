use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("invalid rule {0:?}: expected exactly one \"->\"")]
    InvalidRule(String),

    #[error("invalid address rule {0:?}: expected <proto>://<addr>")]
    InvalidAddress(String),

    #[error("unknown network {0:?}")]
    UnknownNetwork(String),

    #[error("invalid vsock port {0:?}")]
    InvalidPort(String),

    #[error("rule {0:?} forwards to vsock but no dialer was supplied")]
    DialerRequired(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
    Unix,
    /// Guest socket addressed by port number, reached through a backend
    /// dialer.
    Vsock,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unix => "unix",
            Network::Vsock => "vsock",
        }
    }
}

impl FromStr for Network {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, RuleError> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            "unix" => Ok(Network::Unix),
            // An empty protocol on the forward side means vsock.
            "vsock" | "" => Ok(Network::Vsock),
            other => Err(RuleError::UnknownNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub network: Network,
    pub address: String,
}

impl Endpoint {
    pub fn new(network: Network, address: impl Into<String>) -> Self {
        Endpoint {
            network,
            address: address.into(),
        }
    }

    /// The vsock port of a [`Network::Vsock`] endpoint.
    pub fn vsock_port(&self) -> Result<u32, RuleError> {
        self.address
            .parse()
            .map_err(|_| RuleError::InvalidPort(self.address.clone()))
    }

    fn parse(half: &str, rule: &str) -> Result<Self, RuleError> {
        let mut parts = half.split("://");
        let (Some(network), Some(address), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(RuleError::InvalidAddress(rule.to_string()));
        };
        let endpoint = Endpoint::new(network.parse()?, address);
        if endpoint.network == Network::Vsock {
            endpoint.vsock_port()?;
        }
        Ok(endpoint)
    }
}

/// Human readable `network@address`, as used in log lines.
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.network, self.address)
    }
}

/// A parsed `<proto>://<addr>-><proto>://<addr>` forward rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub bind: Endpoint,
    pub forward: Endpoint,
}

impl Rule {
    /// The canonical rule string, used as the key in a
    /// [`ForwardMgr`](crate::ForwardMgr).
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl FromStr for Rule {
    type Err = RuleError;

    fn from_str(rule: &str) -> Result<Self, RuleError> {
        let halves: Vec<&str> = rule.split("->").collect();
        let [bind, forward] = halves[..] else {
            return Err(RuleError::InvalidRule(rule.to_string()));
        };

        let bind = Endpoint::parse(bind, rule)?;
        if bind.address.is_empty() {
            return Err(RuleError::InvalidAddress(rule.to_string()));
        }

        Ok(Rule {
            bind,
            forward: Endpoint::parse(forward, rule)?,
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}->{}://{}",
            self.bind.network, self.bind.address, self.forward.network, self.forward.address
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_tcp_to_vsock() {
        let rule: Rule = "tcp://127.0.0.1:8080->vsock://40443".parse().unwrap();
        assert_eq!(rule.bind, Endpoint::new(Network::Tcp, "127.0.0.1:8080"));
        assert_eq!(rule.forward.network, Network::Vsock);
        assert_eq!(rule.forward.vsock_port().unwrap(), 40443);
        assert_eq!(rule.key(), "tcp://127.0.0.1:8080->vsock://40443");
    }

    #[test]
    fn test_empty_forward_proto_is_vsock() {
        let rule: Rule = "unix:///tmp/a.sock->://10443".parse().unwrap();
        assert_eq!(rule.bind.address, "/tmp/a.sock");
        assert_eq!(rule.forward.network, Network::Vsock);
        assert_eq!(rule.key(), "unix:///tmp/a.sock->vsock://10443");
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(
            "tcp://a:1".parse::<Rule>(),
            Err(RuleError::InvalidRule("tcp://a:1".to_string()))
        );
        assert!(matches!(
            "tcp://a:1->tcp://b:2->tcp://c:3".parse::<Rule>(),
            Err(RuleError::InvalidRule(_))
        ));
        assert!(matches!(
            "tcp:/a:1->tcp://b:2".parse::<Rule>(),
            Err(RuleError::InvalidAddress(_))
        ));
        assert!(matches!(
            "sctp://a:1->tcp://b:2".parse::<Rule>(),
            Err(RuleError::UnknownNetwork(_))
        ));
        assert!(matches!(
            "tcp://a:1->vsock://http".parse::<Rule>(),
            Err(RuleError::InvalidPort(_))
        ));
    }
}

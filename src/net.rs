use std::fmt::Display;
use std::str::FromStr;

use anyhow::bail;

pub const DEFAULT_PORT: Port = 6379;

pub type Port = u16;
pub type Hostname = String;

/// A host/port pair: the local listen address, or the leader a replica
/// attaches to.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub host: Hostname,
    pub port: Port,
}

impl Binding {
    pub fn new(host: impl Into<Hostname>, port: Port) -> Self {
        Binding { host: host.into(), port }
    }

    /// Loopback binding; the server only listens locally.
    pub fn local(port: Port) -> Self {
        Binding::new("127.0.0.1", port)
    }
}

impl Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The `--replicaof` value names the leader space separated: `"<host> <port>"`.
/// Both fields are required; surplus whitespace is tolerated.
impl FromStr for Binding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_whitespace().collect::<Vec<_>>()[..] {
            [host, port] => Ok(Binding::new(host, port.parse::<Port>()?)),
            _ => bail!("expected \"<host> <port>\", got {:?}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        assert_eq!("localhost 6380".parse::<Binding>().unwrap(), Binding::new("localhost", 6380));
        assert_eq!("10.0.0.7   6379".parse::<Binding>().unwrap(), Binding::new("10.0.0.7", 6379));
    }

    #[test]
    fn rejects_missing_or_bad_fields() {
        assert!("localhost".parse::<Binding>().is_err());
        assert!("localhost notaport".parse::<Binding>().is_err());
        assert!("a b c".parse::<Binding>().is_err());
        assert!("".parse::<Binding>().is_err());
    }

    #[test]
    fn displays_as_a_dialable_address() {
        assert_eq!(Binding::new("h", 1).to_string(), "h:1");
        assert_eq!(Binding::local(6379).to_string(), "127.0.0.1:6379");
    }
}

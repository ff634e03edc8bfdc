use crate::error::ProxyError;
use std::fmt;

/// Which kind of request a target came from; decides the default port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Connect,
    Get,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Connect => 443,
            Scheme::Get => 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for OriginAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Split a request target (`host`, `host:port`, `[v6]`, `[v6]:port`) into
/// host and port. The port is taken after the last `:`.
pub fn parse_target(target: &str, scheme: Scheme) -> Result<OriginAddress, ProxyError> {
    let target = target.trim();

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::InvalidTarget(format!("unterminated IPv6 literal in '{}'", target)))?;
        match after {
            "" => (host, None),
            _ => match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => {
                    return Err(ProxyError::InvalidTarget(format!(
                        "unexpected characters after IPv6 literal in '{}'",
                        target
                    )));
                }
            },
        }
    } else {
        match target.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (target, None),
        }
    };

    if host.is_empty() {
        return Err(ProxyError::InvalidTarget(format!("missing host in '{}'", target)));
    }

    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidTarget(format!("invalid port '{}' in '{}'", port, target)))?,
        None => scheme.default_port(),
    };

    Ok(OriginAddress {
        host: host.to_string(),
        port,
    })
}

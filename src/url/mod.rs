
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::*;

/// The scheme of a STUN/TURN server URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemeType {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl SchemeType {
    pub fn is_turn(&self) -> bool {
        matches!(self, Self::Turn | Self::Turns)
    }

    fn default_port(&self) -> u16 {
        match self {
            Self::Stun | Self::Turn => 3478,
            Self::Stuns | Self::Turns => 5349,
        }
    }
}

impl std::str::FromStr for SchemeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stun" => Ok(Self::Stun),
            "stuns" => Ok(Self::Stuns),
            "turn" => Ok(Self::Turn),
            "turns" => Ok(Self::Turns),
            _ => Err(Error::ErrSchemeType),
        }
    }
}

impl fmt::Display for SchemeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Stun => "stun",
            Self::Stuns => "stuns",
            Self::Turn => "turn",
            Self::Turns => "turns",
        };
        write!(f, "{s}")
    }
}

/// Transport requested towards the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoType {
    Udp,
    Tcp,
}

impl fmt::Display for ProtoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        };
        write!(f, "{s}")
    }
}

/// A parsed `stun:`/`turn:` server URL. Hosts must be IP literals; name
/// resolution happens outside this crate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerUrl {
    pub scheme: SchemeType,
    pub addr: SocketAddr,
    pub proto: ProtoType,
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}?transport={}",
            self.scheme,
            self.addr.ip(),
            self.addr.port(),
            self.proto
        )
    }
}

impl ServerUrl {
    /// Parses `stun:1.2.3.4:3478` / `turn:1.2.3.4?transport=tcp` style
    /// URLs, RFC 7064 / RFC 7065 syntax restricted to IP hosts.
    pub fn parse(raw: &str) -> Result<ServerUrl> {
        // stun URLs have no authority component, so lend them one to make
        // the url crate expose host and port.
        let (scheme_raw, rest) = raw.split_once(':').ok_or(Error::ErrSchemeType)?;
        let scheme: SchemeType = scheme_raw.parse()?;
        let parsed = url::Url::parse(&format!("{scheme_raw}://{rest}"))?;

        let host = parsed.host_str().ok_or(Error::ErrHost)?;
        // The url crate brackets IPv6 hosts.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host.parse().map_err(|_| Error::ErrHost)?;
        let port = parsed.port().unwrap_or_else(|| scheme.default_port());

        let proto = match parsed.query() {
            Some("transport=udp") => ProtoType::Udp,
            Some("transport=tcp") => ProtoType::Tcp,
            Some(_) => return Err(Error::ErrProtoType),
            None => match scheme {
                SchemeType::Stuns | SchemeType::Turns => ProtoType::Tcp,
                _ => ProtoType::Udp,
            },
        };

        Ok(ServerUrl {
            scheme,
            addr: SocketAddr::new(ip, port),
            proto,
        })
    }
}

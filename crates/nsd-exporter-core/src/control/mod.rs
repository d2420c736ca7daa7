//! Control channel of NSD and Unbound.
//!
//! Both daemons accept a single text command per connection, prefixed with a
//! protocol banner, and stream the answer back until they close the
//! connection. TCP endpoints are normally wrapped in TLS with client
//! certificates; Unix-socket endpoints are plain.

mod client;
pub mod conf;

pub use client::{ClientOptions, ControlClient};
pub use conf::{ControlConfError, RemoteControl, endpoint_from_config};

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

/// Port both daemons listen on for control connections by default.
pub const DEFAULT_CONTROL_PORT: u16 = 8952;

/// Daemon flavour. Also used as the metric namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DaemonKind {
    #[default]
    Nsd,
    Unbound,
}

impl DaemonKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DaemonKind::Nsd => "nsd",
            DaemonKind::Unbound => "unbound",
        }
    }

    /// Banner written before every command.
    pub fn protocol_prefix(self) -> &'static str {
        match self {
            DaemonKind::Nsd => "NSDCT1",
            DaemonKind::Unbound => "UBCT1",
        }
    }

    /// Name the daemon's self-signed server certificate is issued for.
    pub fn server_name(self) -> &'static str {
        self.as_str()
    }

    pub fn default_config_path(self) -> &'static str {
        match self {
            DaemonKind::Nsd => "/etc/nsd/nsd.conf",
            DaemonKind::Unbound => "/etc/unbound/unbound.conf",
        }
    }

    /// Standard locations of server certificate, control key and control
    /// certificate, as created by `nsd-control-setup` / `unbound-control-setup`.
    pub fn default_tls_files(self) -> TlsFiles {
        let dir = format!("/etc/{}", self.as_str());
        let name = self.as_str();
        TlsFiles {
            ca: PathBuf::from(format!("{dir}/{name}_server.pem")),
            key: PathBuf::from(format!("{dir}/{name}_control.key")),
            cert: PathBuf::from(format!("{dir}/{name}_control.pem")),
        }
    }
}

impl FromStr for DaemonKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nsd" => Ok(DaemonKind::Nsd),
            "unbound" => Ok(DaemonKind::Unbound),
            other => Err(format!("unsupported daemon type '{other}' (expected nsd or unbound)")),
        }
    }
}

impl fmt::Display for DaemonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials for a TLS control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    /// Server certificate (or CA) the daemon must present.
    pub ca: PathBuf,
    /// Client private key, PKCS#8 PEM.
    pub key: PathBuf,
    /// Client certificate, PEM.
    pub cert: PathBuf,
}

/// Where the control channel lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp {
        host: String,
        port: u16,
        tls: Option<TlsFiles>,
    },
    Unix(PathBuf),
}

impl Endpoint {
    /// Parses a command-line address.
    ///
    /// Absolute paths are Unix sockets. Otherwise the address is `host`,
    /// `host:port`, an IP literal or `[v6]:port`; the port defaults to 8952.
    pub fn parse(address: &str, tls: Option<TlsFiles>) -> Result<Self, String> {
        let address = address.trim();
        if address.is_empty() {
            return Err("empty control address".to_string());
        }
        if address.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(address)));
        }

        let (host, port) = if let Ok(addr) = address.parse::<SocketAddr>() {
            (addr.ip().to_string(), addr.port())
        } else if let Ok(ip) = address.parse::<IpAddr>() {
            (ip.to_string(), DEFAULT_CONTROL_PORT)
        } else if let Some((host, port)) = address.rsplit_once(':') {
            let port = port
                .parse()
                .map_err(|_| format!("invalid port in control address '{address}'"))?;
            (host.to_string(), port)
        } else {
            (address.to_string(), DEFAULT_CONTROL_PORT)
        };

        Ok(Endpoint::Tcp { host, port, tls })
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Endpoint::Unix(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port, .. } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Endpoint::Tcp { host, port, .. } => write!(f, "{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

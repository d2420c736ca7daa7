//! Reads the `remote-control:` clause of `nsd.conf` / `unbound.conf`.
//!
//! Only the handful of entries needed to reach the control channel are
//! interpreted; everything else in the file is ignored.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::{DEFAULT_CONTROL_PORT, DaemonKind, Endpoint, TlsFiles};

const CLAUSE: &str = "remote-control";
const DEFAULT_INTERFACE: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum ControlConfError {
    #[error("failed to read daemon config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote control is disabled (control-enable: no)")]
    Disabled,

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// Entries of the `remote-control:` clause. `None` means "not set".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteControl {
    pub enabled: Option<bool>,
    pub interface: Option<String>,
    pub port: Option<u16>,
    pub server_cert_file: Option<PathBuf>,
    pub control_key_file: Option<PathBuf>,
    pub control_cert_file: Option<PathBuf>,
    /// Unbound's `control-use-cert`; NSD always uses certificates over TCP.
    pub use_cert: bool,
}

impl Default for RemoteControl {
    fn default() -> Self {
        Self {
            enabled: None,
            interface: None,
            port: None,
            server_cert_file: None,
            control_key_file: None,
            control_cert_file: None,
            use_cert: true,
        }
    }
}

impl RemoteControl {
    pub fn from_path(path: &Path) -> Result<Self, ControlConfError> {
        let text = std::fs::read_to_string(path).map_err(|source| ControlConfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ControlConfError> {
        let mut rc = RemoteControl::default();
        let mut in_clause = false;

        for raw in text.lines() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();

            // `name:` with nothing after it opens a clause.
            if value.is_empty() {
                in_clause = name == CLAUSE;
                continue;
            }
            // An explicitly empty value (`""`) leaves the entry unset.
            let value = unquote(value);
            if !in_clause || value.is_empty() {
                continue;
            }

            match name {
                "control-enable" => rc.enabled = Some(yes_no(name, value)?),
                "control-use-cert" => rc.use_cert = yes_no(name, value)?,
                "control-interface" => {
                    // The daemon listens on all of them; the first is enough.
                    if rc.interface.is_none() {
                        rc.interface = Some(value.to_string());
                    }
                }
                "control-port" => {
                    let port = value.parse().map_err(|_| invalid(name, value))?;
                    rc.port = Some(port);
                }
                "server-cert-file" => rc.server_cert_file = Some(PathBuf::from(value)),
                "control-key-file" => rc.control_key_file = Some(PathBuf::from(value)),
                "control-cert-file" => rc.control_cert_file = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        Ok(rc)
    }

    /// Control endpoint, filling unset entries with the daemon's defaults.
    pub fn endpoint(&self, kind: DaemonKind) -> Result<Endpoint, ControlConfError> {
        if self.enabled == Some(false) {
            return Err(ControlConfError::Disabled);
        }

        let interface = self.interface.as_deref().unwrap_or(DEFAULT_INTERFACE);
        if interface.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(interface)));
        }

        let tls = self.use_cert.then(|| {
            let defaults = kind.default_tls_files();
            TlsFiles {
                ca: self.server_cert_file.clone().unwrap_or(defaults.ca),
                key: self.control_key_file.clone().unwrap_or(defaults.key),
                cert: self.control_cert_file.clone().unwrap_or(defaults.cert),
            }
        });

        Ok(Endpoint::Tcp {
            host: interface.to_string(),
            port: self.port.unwrap_or(DEFAULT_CONTROL_PORT),
            tls,
        })
    }
}

/// Reads `path` and derives the control endpoint from it.
pub fn endpoint_from_config(path: &Path, kind: DaemonKind) -> Result<Endpoint, ControlConfError> {
    let rc = RemoteControl::from_path(path)?;
    let endpoint = rc.endpoint(kind)?;
    debug!(config = %path.display(), %endpoint, "control endpoint from daemon config");
    Ok(endpoint)
}

fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '#' if !quoted => return &line[..i],
            _ => {}
        }
    }
    line
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn yes_no(key: &str, value: &str) -> Result<bool, ControlConfError> {
    match value.to_ascii_lowercase().as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ControlConfError {
    ControlConfError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const NSD_CONF: &str = r#"
server:
    ip-address: 192.0.2.1
    # control-interface: 10.9.9.9 (commented, and outside the clause)

remote-control:
    control-enable: yes
    control-interface: 127.0.0.1   # loopback only
    control-interface: ::1
    control-port: 8953
    server-cert-file: "/srv/nsd/nsd_server.pem"
    control-key-file: /srv/nsd/nsd_control.key
    control-cert-file: /srv/nsd/nsd_control.pem

zone:
    name: example.com
    zonefile: example.com.zone
"#;

    #[test]
    fn parses_remote_control_clause() {
        let rc = RemoteControl::parse(NSD_CONF).unwrap();
        assert_eq!(rc.enabled, Some(true));
        assert_eq!(rc.interface.as_deref(), Some("127.0.0.1"));
        assert_eq!(rc.port, Some(8953));
        assert_eq!(rc.server_cert_file, Some(PathBuf::from("/srv/nsd/nsd_server.pem")));

        let endpoint = rc.endpoint(DaemonKind::Nsd).unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 8953,
                tls: Some(TlsFiles {
                    ca: "/srv/nsd/nsd_server.pem".into(),
                    key: "/srv/nsd/nsd_control.key".into(),
                    cert: "/srv/nsd/nsd_control.pem".into(),
                }),
            }
        );
    }

    #[test]
    fn entries_outside_the_clause_are_ignored() {
        let text = "server:\n    control-port: 1\nremote-control:\n    control-enable: yes\n";
        let rc = RemoteControl::parse(text).unwrap();
        assert_eq!(rc.port, None);
    }

    #[test]
    fn missing_entries_use_daemon_defaults() {
        let rc = RemoteControl::parse("remote-control:\n  control-enable: yes\n").unwrap();
        let endpoint = rc.endpoint(DaemonKind::Unbound).unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 8952,
                tls: Some(DaemonKind::Unbound.default_tls_files()),
            }
        );
    }

    #[test]
    fn socket_path_interface_is_unix_endpoint() {
        let text = "remote-control:\n  control-enable: yes\n  control-interface: /run/unbound.ctl\n";
        let endpoint = RemoteControl::parse(text)
            .unwrap()
            .endpoint(DaemonKind::Unbound)
            .unwrap();
        assert_eq!(endpoint, Endpoint::Unix("/run/unbound.ctl".into()));
    }

    #[test]
    fn control_use_cert_no_gives_plain_tcp() {
        let text = "remote-control:\n  control-use-cert: no\n";
        let endpoint = RemoteControl::parse(text)
            .unwrap()
            .endpoint(DaemonKind::Unbound)
            .unwrap();
        assert!(matches!(endpoint, Endpoint::Tcp { tls: None, .. }));
    }

    #[test]
    fn disabled_control_is_an_error() {
        let rc = RemoteControl::parse("remote-control:\n  control-enable: no\n").unwrap();
        assert!(matches!(
            rc.endpoint(DaemonKind::Nsd),
            Err(ControlConfError::Disabled)
        ));
    }

    #[test]
    fn bad_values_are_rejected() {
        let err = RemoteControl::parse("remote-control:\n  control-port: eighty\n").unwrap_err();
        assert!(matches!(err, ControlConfError::InvalidValue { ref key, .. } if key == "control-port"));
        assert!(RemoteControl::parse("remote-control:\n  control-enable: maybe\n").is_err());
    }

    #[test]
    fn reads_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(NSD_CONF.as_bytes()).unwrap();

        let endpoint = endpoint_from_config(file.path(), DaemonKind::Nsd).unwrap();
        assert_eq!(endpoint.to_string(), "127.0.0.1:8953");
    }

    #[test]
    fn missing_config_file_is_io_error() {
        let err = endpoint_from_config(Path::new("/nonexistent/nsd.conf"), DaemonKind::Nsd)
            .unwrap_err();
        assert!(matches!(err, ControlConfError::Io { .. }));
    }

    #[test]
    fn empty_quoted_value_does_not_end_the_clause() {
        let text = "remote-control:\n  control-interface: \"\"\n  control-port: 9000\n";
        let rc = RemoteControl::parse(text).unwrap();
        assert_eq!(rc.interface, None);
        assert_eq!(rc.port, Some(9000));
    }

    #[test]
    fn hash_inside_quotes_is_kept() {
        assert_eq!(strip_comment(r#"a: "x#y" # c"#), r#"a: "x#y" "#);
    }
}

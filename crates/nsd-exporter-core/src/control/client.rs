//! Blocking control-channel client.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use native_tls::{Certificate, HandshakeError, Identity, TlsConnector};
use tracing::{debug, trace};

use super::{DaemonKind, Endpoint, TlsFiles};
use crate::collector::transport::{ControlTransport, TransportError};

/// Upper bound on a single response; stats output is a few kilobytes.
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Bound for connecting and for the whole exchange.
    pub timeout: Duration,
    /// Accept any server certificate. Only for testing setups.
    pub insecure_skip_verify: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            insecure_skip_verify: false,
        }
    }
}

/// Client for one daemon. Opens a new connection per command, so it can be
/// shared between concurrent scrapes without extra locking.
pub struct ControlClient {
    kind: DaemonKind,
    endpoint: Endpoint,
    connector: Option<TlsConnector>,
    options: ClientOptions,
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("tls", &self.connector.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl ControlClient {
    /// Builds a client, loading TLS credentials up front so that missing or
    /// unreadable files are reported at startup.
    pub fn new(
        kind: DaemonKind,
        endpoint: Endpoint,
        options: ClientOptions,
    ) -> Result<Self, TransportError> {
        let connector = match &endpoint {
            Endpoint::Tcp { tls: Some(files), .. } => {
                Some(tls_connector(files, options.insecure_skip_verify)?)
            }
            _ => None,
        };
        debug!(%kind, %endpoint, tls = connector.is_some(), "control client configured");
        Ok(Self {
            kind,
            endpoint,
            connector,
            options,
        })
    }

    pub fn kind(&self) -> DaemonKind {
        self.kind
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream, TransportError> {
        let endpoint = self.endpoint.to_string();
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.options.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.options.timeout))?;
                    stream.set_write_timeout(Some(self.options.timeout))?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(TransportError::Connect {
            endpoint,
            source: last_err,
        })
    }

    #[cfg(unix)]
    fn send_unix(&self, path: &Path, request: &str) -> Result<Vec<u8>, TransportError> {
        let stream = std::os::unix::net::UnixStream::connect(path).map_err(|source| {
            TransportError::Connect {
                endpoint: self.endpoint.to_string(),
                source,
            }
        })?;
        stream.set_read_timeout(Some(self.options.timeout))?;
        stream.set_write_timeout(Some(self.options.timeout))?;
        exchange(stream, request, self.options.timeout)
    }

    #[cfg(not(unix))]
    fn send_unix(&self, path: &Path, _request: &str) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::InvalidAddress(path.display().to_string()))
    }
}

impl ControlTransport for ControlClient {
    fn command(&self, command: &str) -> Result<String, TransportError> {
        let request = format!("{} {}\n", self.kind.protocol_prefix(), command);
        let started = Instant::now();

        let raw = match &self.endpoint {
            Endpoint::Unix(path) => self.send_unix(path, &request)?,
            Endpoint::Tcp { host, port, .. } => {
                let stream = self.connect_tcp(host, *port)?;
                match &self.connector {
                    Some(connector) => {
                        let tls = connector
                            .connect(self.kind.server_name(), stream)
                            .map_err(|e| self.handshake_error(e))?;
                        exchange(tls, &request, self.options.timeout)?
                    }
                    None => exchange(stream, &request, self.options.timeout)?,
                }
            }
        };

        trace!(command, bytes = raw.len(), elapsed = ?started.elapsed(), "control command done");
        check_response(command, String::from_utf8_lossy(&raw).into_owned())
    }
}

impl ControlClient {
    fn handshake_error(&self, e: HandshakeError<TcpStream>) -> TransportError {
        match e {
            HandshakeError::Failure(e) => TransportError::Handshake {
                endpoint: self.endpoint.to_string(),
                message: e.to_string(),
            },
            HandshakeError::WouldBlock(_) => TransportError::Timeout(self.options.timeout),
        }
    }
}

fn tls_connector(files: &TlsFiles, insecure: bool) -> Result<TlsConnector, TransportError> {
    let ca = read_credential("server certificate", &files.ca)?;
    let cert = read_credential("client certificate", &files.cert)?;
    let key = read_credential("client key", &files.key)?;

    let mut builder = TlsConnector::builder();
    builder
        .identity(Identity::from_pkcs8(&cert, &key)?)
        .add_root_certificate(Certificate::from_pem(&ca)?)
        .disable_built_in_roots(true);
    if insecure {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    Ok(builder.build()?)
}

fn read_credential(what: &'static str, path: &Path) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path).map_err(|source| TransportError::Credentials {
        what,
        path: path.display().to_string(),
        source,
    })
}

/// Stream whose blocking reads can be bounded.
trait ReadTimeout: Read + Write {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl ReadTimeout for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

#[cfg(unix)]
impl ReadTimeout for std::os::unix::net::UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }
}

impl ReadTimeout for native_tls::TlsStream<TcpStream> {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.get_ref().set_read_timeout(timeout)
    }
}

/// Writes the request and reads until the peer closes, within `timeout`.
///
/// Every read is bounded by the time left, so a daemon trickling data
/// cannot stretch the exchange past the deadline.
fn exchange<S: ReadTimeout>(
    mut stream: S,
    request: &str,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let deadline = Instant::now() + timeout;
    stream
        .write_all(request.as_bytes())
        .and_then(|()| stream.flush())
        .map_err(|e| io_error(e, timeout))?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout(timeout));
        }
        stream.set_read_timeout(Some(remaining))?;
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                response.extend_from_slice(&chunk[..n]);
                if response.len() > MAX_RESPONSE_BYTES {
                    return Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "control response too large",
                    )));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Some daemons close without a TLS close_notify.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && !response.is_empty() => break,
            Err(e) => return Err(io_error(e, timeout)),
        }
    }
    Ok(response)
}

fn io_error(e: io::Error, timeout: Duration) -> TransportError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout(timeout),
        _ => TransportError::Io(e),
    }
}

/// Rejects empty answers and the daemon's `error ...` replies.
fn check_response(command: &str, response: String) -> Result<String, TransportError> {
    let first = response.lines().map(str::trim).find(|l| !l.is_empty());
    match first {
        None => Err(TransportError::EmptyResponse(command.to_string())),
        Some(line) if line.starts_with("error") => Err(TransportError::Rejected {
            command: command.to_string(),
            message: line.to_string(),
        }),
        Some(_) => Ok(response),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::thread;

    fn plain_tcp_client(port: u16) -> ControlClient {
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
            tls: None,
        };
        let options = ClientOptions {
            timeout: Duration::from_secs(2),
            insecure_skip_verify: false,
        };
        ControlClient::new(DaemonKind::Unbound, endpoint, options).unwrap()
    }

    /// Accepts one connection, records the request line and sends `reply`.
    fn serve_once(reply: &'static str) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = io::BufReader::new(stream);
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            reader.get_mut().write_all(reply.as_bytes()).unwrap();
            request
        });
        (port, handle)
    }

    #[test]
    fn sends_banner_and_reads_until_close() {
        let (port, server) = serve_once("total.num.queries=12\ntime.up=3.5\n");
        let client = plain_tcp_client(port);

        let response = client.command("stats_noreset").unwrap();
        assert_eq!(response, "total.num.queries=12\ntime.up=3.5\n");
        assert_eq!(server.join().unwrap(), "UBCT1 stats_noreset\n");
    }

    #[test]
    fn error_reply_is_rejected() {
        let (port, server) = serve_once("error unknown command 'stats_noreset'\n");
        let err = plain_tcp_client(port).command("stats_noreset").unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, TransportError::Rejected { .. }));
    }

    #[test]
    fn empty_reply_is_an_error() {
        let (port, server) = serve_once("");
        let err = plain_tcp_client(port).command("stats_noreset").unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, TransportError::EmptyResponse(_)));
    }

    #[test]
    fn refused_connection_is_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = plain_tcp_client(port).command("stats_noreset").unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[test]
    fn silent_daemon_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(600));
            drop(stream);
        });

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
            tls: None,
        };
        let options = ClientOptions {
            timeout: Duration::from_millis(200),
            insecure_skip_verify: false,
        };
        let client = ControlClient::new(DaemonKind::Nsd, endpoint, options).unwrap();
        let err = client.command("stats_noreset").unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[test]
    fn trickling_daemon_is_cut_off_at_the_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
            let _ = stream.write_all(b"num.queries=1\n");
            thread::sleep(Duration::from_millis(1200));
        });

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
            tls: None,
        };
        let options = ClientOptions {
            timeout: Duration::from_millis(400),
            insecure_skip_verify: false,
        };
        let client = ControlClient::new(DaemonKind::Nsd, endpoint, options).unwrap();

        let started = Instant::now();
        let err = client.command("stats_noreset").unwrap_err();
        let elapsed = started.elapsed();
        server.join().unwrap();

        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(elapsed < Duration::from_millis(650), "took {elapsed:?}");
    }

    #[test]
    fn missing_credentials_fail_construction() {
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 8952,
            tls: Some(TlsFiles {
                ca: "/nonexistent/nsd_server.pem".into(),
                key: "/nonexistent/nsd_control.key".into(),
                cert: "/nonexistent/nsd_control.pem".into(),
            }),
        };
        let err = ControlClient::new(DaemonKind::Nsd, endpoint, ClientOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Credentials {
                what: "server certificate",
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn talks_over_unix_socket() {
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsd.ctl");
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = io::BufReader::new(stream);
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            reader.get_mut().write_all(b"num.queries=1\n").unwrap();
            request
        });

        let client = ControlClient::new(
            DaemonKind::Nsd,
            Endpoint::Unix(path),
            ClientOptions::default(),
        )
        .unwrap();
        assert_eq!(client.command("stats_noreset").unwrap(), "num.queries=1\n");
        assert_eq!(server.join().unwrap(), "NSDCT1 stats_noreset\n");
    }

    #[test]
    fn check_response_skips_leading_blank_lines() {
        assert!(check_response("x", "\n\nnum.queries=1\n".to_string()).is_ok());
        assert!(check_response("x", "  \n".to_string()).is_err());
    }
}

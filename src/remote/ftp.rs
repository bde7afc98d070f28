//! Plain FTP transport.
//!
//! A minimal control-channel client: login, `NOOP` as the liveness probe and
//! passive-mode `LIST` for directory listings. Only what the remote collector
//! needs is implemented; file retrieval is not.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use super::connection::{ConnectionInfo, Connector, Timeouts, Transport, TransportError};

/// Opens FTP control connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct FtpConnector;

impl FtpConnector {
    /// Create a connector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Connector for FtpConnector {
    type Transport = FtpTransport;

    fn scheme(&self) -> &str {
        "ftp"
    }

    fn connect(&self, info: &ConnectionInfo, timeouts: &Timeouts) -> Result<FtpTransport, TransportError> {
        let stream = dial(&info.host, info.port, timeouts.connect)?;
        let peer = stream
            .peer_addr()
            .map_err(|e| TransportError::from_io("peer address", &e))?
            .ip();
        stream
            .set_read_timeout(Some(timeouts.response))
            .and_then(|()| stream.set_write_timeout(Some(timeouts.response)))
            .and_then(|()| stream.set_nodelay(true))
            .map_err(|e| TransportError::from_io("socket setup", &e))?;
        let writer = stream
            .try_clone()
            .map_err(|e| TransportError::from_io("socket setup", &e))?;

        let mut transport = FtpTransport {
            reader: BufReader::new(stream),
            writer,
            peer,
            timeouts: *timeouts,
        };

        let greeting = transport.read_reply()?;
        if greeting.code != 220 {
            return Err(TransportError::Protocol(greeting.text));
        }
        transport.login(&info.username, &info.password)?;
        log::debug!("Logged in to {} as {}", info.address(), info.username);
        Ok(transport)
    }
}

fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransportError> {
    let target = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect {
            target: target.clone(),
            reason: e.to_string(),
        })?
        .collect();

    let mut last_error = String::from("no addresses resolved");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(TransportError::Connect {
        target,
        reason: last_error,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }
}

/// One authenticated FTP control connection.
///
/// Dropping the transport sends `QUIT` and closes the socket.
#[derive(Debug)]
pub struct FtpTransport {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: IpAddr,
    timeouts: Timeouts,
}

impl FtpTransport {
    fn send(&mut self, command: &str) -> Result<(), TransportError> {
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|e| TransportError::from_io("send", &e))
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|e| TransportError::from_io("read reply", &e))?;
        if read == 0 {
            return Err(TransportError::Io("connection closed by server".to_string()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn read_reply(&mut self) -> Result<Reply, TransportError> {
        let first = self.read_line()?;
        let code = first
            .get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| TransportError::Protocol(format!("malformed reply: {first}")))?;

        let mut text = first.clone();
        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                let line = self.read_line()?;
                text.push('\n');
                text.push_str(&line);
                if line.starts_with(&terminator) || line == code.to_string() {
                    break;
                }
            }
        }
        Ok(Reply { code, text })
    }

    fn command(&mut self, command: &str) -> Result<Reply, TransportError> {
        self.send(command)?;
        self.read_reply()
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), TransportError> {
        let reply = self.command(&format!("USER {username}"))?;
        let reply = match reply.code {
            230 => return Ok(()),
            331 | 332 => self.command(&format!("PASS {password}"))?,
            530 => return Err(TransportError::Auth(reply.text)),
            _ => return Err(TransportError::Protocol(reply.text)),
        };
        match reply.code {
            230 | 202 => Ok(()),
            530 => Err(TransportError::Auth(reply.text)),
            _ => Err(TransportError::Protocol(reply.text)),
        }
    }

    fn open_passive(&mut self) -> Result<TcpStream, TransportError> {
        let reply = self.command("PASV")?;
        if reply.code != 227 {
            return Err(TransportError::Protocol(reply.text));
        }
        let port = parse_pasv_port(&reply.text)
            .ok_or_else(|| TransportError::Protocol(format!("bad PASV reply: {}", reply.text)))?;

        // The advertised address is ignored; servers behind NAT often
        // report a private one.
        let addr = SocketAddr::new(self.peer, port);
        let data = TcpStream::connect_timeout(&addr, self.timeouts.connect).map_err(|e| {
            TransportError::Connect {
                target: addr.to_string(),
                reason: e.to_string(),
            }
        })?;
        data.set_read_timeout(Some(self.timeouts.response))
            .map_err(|e| TransportError::from_io("data socket setup", &e))?;
        Ok(data)
    }
}

fn pasv_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})")
            .expect("pasv pattern is valid")
    })
}

fn parse_pasv_port(text: &str) -> Option<u16> {
    let caps = pasv_pattern().captures(text)?;
    let high: u16 = caps.get(5)?.as_str().parse().ok()?;
    let low: u16 = caps.get(6)?.as_str().parse().ok()?;
    if high > 255 || low > 255 {
        return None;
    }
    Some(high * 256 + low)
}

impl Transport for FtpTransport {
    fn probe(&mut self) -> Result<(), TransportError> {
        let reply = self.command("NOOP")?;
        if reply.is_positive() {
            Ok(())
        } else {
            Err(TransportError::Protocol(reply.text))
        }
    }

    fn list(&mut self, directory: &str) -> Result<Vec<u8>, TransportError> {
        let reply = self.command(&format!("CWD {directory}"))?;
        if !reply.is_positive() {
            return Err(TransportError::Protocol(reply.text));
        }

        let mut data = self.open_passive()?;
        let reply = self.command("LIST")?;
        if !reply.is_preliminary() && !reply.is_positive() {
            return Err(TransportError::Protocol(reply.text));
        }

        let mut listing = Vec::new();
        data.read_to_end(&mut listing)
            .map_err(|e| TransportError::from_io("read listing", &e))?;
        drop(data);

        if reply.is_preliminary() {
            let done = self.read_reply()?;
            if !done.is_positive() {
                return Err(TransportError::Protocol(done.text));
            }
        }
        Ok(listing)
    }
}

impl Drop for FtpTransport {
    fn drop(&mut self) {
        let _ = self.send("QUIT");
    }
}

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time;

use super::command::{Command, MAX_FRAME, Reply};
use super::{DeviceSession, DeviceTransport};
use crate::error::DeviceError;

pub const DEFAULT_PORT: u16 = 4352;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Ready,
    Sending,
}

/// One TCP session with one projector. Commands go out one at a time.
pub struct PjLinkSession {
    address: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    state: SessionState,
    timeout: Duration,
    class: Option<String>,
}

impl PjLinkSession {
    pub async fn connect(
        address: &str,
        secret: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let target = with_default_port(address);
        log::debug!("{}: {:?}", target, SessionState::Connecting);

        let stream = match time::timeout(timeout, TcpStream::connect(&target)).await {
            Err(_) => return Err(DeviceError::Timeout("connect")),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(DeviceError::ConnectionRefused);
            }
            Ok(Err(e)) => return Err(DeviceError::Unreachable(e.to_string())),
            Ok(Ok(stream)) => stream,
        };

        let (read_half, write_half) = stream.into_split();
        let mut session = Self {
            address: target,
            reader: BufReader::new(read_half),
            writer: write_half,
            state: SessionState::AwaitingChallenge,
            timeout,
            class: None,
        };

        let token = session.await_challenge().await?;
        session.authenticate(token, secret).await?;
        log::debug!(
            "{}: ready (class {})",
            session.address,
            session.class.as_deref().unwrap_or("?")
        );
        Ok(session)
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    async fn await_challenge(&mut self) -> Result<Option<String>, DeviceError> {
        let greeting = self.read_frame("greeting").await;
        let parsed = greeting.and_then(|line| parse_greeting(&line));
        if parsed.is_err() {
            self.state = SessionState::Disconnected;
        }
        parsed
    }

    /// The digest rides on the first command; `CLSS ?` doubles as the credential check.
    async fn authenticate(
        &mut self,
        token: Option<String>,
        secret: Option<&str>,
    ) -> Result<(), DeviceError> {
        self.state = SessionState::Authenticating;

        let prefix = match (token, secret) {
            (None, _) => String::new(),
            (Some(_), None) => {
                self.state = SessionState::Disconnected;
                return Err(DeviceError::AuthenticationFailed(
                    "device requires a password and none is configured".to_string(),
                ));
            }
            (Some(token), Some(secret)) => digest(&token, secret),
        };

        let probe = Command::query("CLSS")?;
        match self.exchange(&prefix, &probe).await {
            Ok(reply) => self.class = Some(reply.data),
            // A refusal still proves the digest was accepted.
            Err(DeviceError::Protocol(code)) => {
                log::debug!("{}: class query refused: {}", self.address, code);
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(e);
            }
        }

        self.state = SessionState::Ready;
        Ok(())
    }

    async fn exchange(&mut self, prefix: &str, command: &Command) -> Result<Reply, DeviceError> {
        let frame = format!("{}{}\r", prefix, command.wire());
        log::debug!("{} <- {}", self.address, command.wire());

        match time::timeout(self.timeout, self.writer.write_all(frame.as_bytes())).await {
            Err(_) => return Err(DeviceError::Timeout("write")),
            Ok(Err(e)) => return Err(DeviceError::Unreachable(e.to_string())),
            Ok(Ok(())) => {}
        }

        let line = self.read_frame("read").await?;
        log::debug!("{} -> {}", self.address, line);
        Reply::parse(&line, command.body())
    }

    async fn read_frame(&mut self, op: &'static str) -> Result<String, DeviceError> {
        let mut buf = Vec::with_capacity(MAX_FRAME);
        let mut limited = (&mut self.reader).take(MAX_FRAME as u64);

        let read = time::timeout(self.timeout, limited.read_until(b'\r', &mut buf))
            .await
            .map_err(|_| DeviceError::Timeout(op))?
            .map_err(|e| DeviceError::Unreachable(e.to_string()))?;

        if read == 0 {
            return Err(DeviceError::Unreachable("connection closed by device".to_string()));
        }
        if buf.last() != Some(&b'\r') {
            if buf.len() >= MAX_FRAME {
                return Err(DeviceError::MalformedReply(format!(
                    "frame exceeds {} bytes",
                    MAX_FRAME
                )));
            }
            return Err(DeviceError::Unreachable("connection closed mid-reply".to_string()));
        }

        buf.pop();
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[async_trait]
impl DeviceSession for PjLinkSession {
    async fn send(&mut self, command: &Command) -> Result<Reply, DeviceError> {
        if self.state != SessionState::Ready {
            return Err(DeviceError::Unreachable(format!(
                "session is {:?}, not ready",
                self.state
            )));
        }

        self.state = SessionState::Sending;
        let result = self.exchange("", command).await;
        self.state = match &result {
            Err(e) if e.is_network() || matches!(e, DeviceError::MalformedReply(_)) => {
                SessionState::Disconnected
            }
            _ => SessionState::Ready,
        };
        result
    }

    async fn close(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        let _ = time::timeout(self.timeout, self.writer.shutdown()).await;
        self.state = SessionState::Disconnected;
    }
}

/// Opens real sessions over TCP.
#[derive(Debug, Clone)]
pub struct PjLinkTransport {
    timeout: Duration,
}

impl PjLinkTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DeviceTransport for PjLinkTransport {
    async fn connect(
        &self,
        address: &str,
        secret: Option<&str>,
    ) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let session = PjLinkSession::connect(address, secret, self.timeout).await?;
        Ok(Box::new(session))
    }
}

/// `PJLINK 0` means no authentication, `PJLINK 1 <token>` asks for a digest.
fn parse_greeting(line: &str) -> Result<Option<String>, DeviceError> {
    let mut parts = line.split_whitespace();
    let banner = parts.next().unwrap_or_default();
    if !banner.eq_ignore_ascii_case("PJLINK") {
        return Err(DeviceError::MalformedReply(format!("unexpected greeting {:?}", line)));
    }

    match (parts.next(), parts.next()) {
        (Some("0"), None) => Ok(None),
        (Some("1"), Some(token))
            if !token.is_empty() && token.len() <= 32 && token.chars().all(|c| c.is_ascii_graphic()) =>
        {
            Ok(Some(token.to_string()))
        }
        (Some(code), None) if code.eq_ignore_ascii_case("ERRA") => Err(
            DeviceError::AuthenticationFailed("device refused the session".to_string()),
        ),
        _ => Err(DeviceError::MalformedReply(format!("unexpected greeting {:?}", line))),
    }
}

pub fn digest(token: &str, secret: &str) -> String {
    format!("{:x}", md5::compute(format!("{}{}", token, secret)))
}

fn with_default_port(address: &str) -> String {
    let address = address.trim();
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_PORT).to_string();
    }
    match address.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{}:{}", address, DEFAULT_PORT),
    }
}

//! Command client for the XPAD acquisition server.
//!
//! `ProtocolClient` owns one connection. Commands are single newline-terminated
//! ASCII lines; replies are read with [`read_event`] until a result of the expected
//! type arrives. Messages the server interleaves before the result (errors, debug
//! lines, progress) are written to the log and do not end the exchange.

use super::connection::Connection;
use super::response::{read_event, NumericKind, ResponseEvent};
use crate::error::{ConnectionError, ProtocolError, XpadError, XpadResult};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;

/// Default TCP port of the acquisition server.
pub const DEFAULT_PORT: u16 = 3456;

/// Result returned by the server when the real answer is an explanatory string.
pub const STRING_FOLLOWS: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Integer,
    Float,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
enum Reply {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Line-oriented client for one connection to the detector server.
///
/// Generic over the stream so tests can substitute an in-memory duplex.
#[derive(Debug)]
pub struct ProtocolClient<S = TcpStream> {
    conn: Option<Connection<S>>,
    peer: Option<SocketAddr>,
}

impl Default for ProtocolClient<TcpStream> {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolClient<TcpStream> {
    /// A client with no connection.
    pub fn new() -> Self {
        Self {
            conn: None,
            peer: None,
        }
    }

    /// Resolve `host`, open the socket and disable send coalescing.
    ///
    /// `connect_timeout` bounds only the TCP handshake; command exchanges have no timeout.
    pub async fn connect(
        &mut self,
        host: &str,
        port: u16,
        connect_timeout: Option<Duration>,
    ) -> Result<(), ConnectionError> {
        if self.conn.is_some() {
            return Err(ConnectionError::AlreadyConnected);
        }

        let addr = lookup_host((host, port))
            .await
            .map_err(|source| ConnectionError::ResolutionFailed {
                host: host.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| ConnectionError::ResolutionFailed {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ConnectionError::SocketCreateFailed)?;

        let stream = match connect_timeout {
            Some(limit) => timeout(limit, socket.connect(addr))
                .await
                .map_err(|_| ConnectionError::TimedOut { addr })?,
            None => socket.connect(addr).await,
        }
        .map_err(|source| ConnectionError::RefusedOrUnreachable { addr, source })?;

        stream
            .set_nodelay(true)
            .map_err(ConnectionError::OptionSetFailed)?;

        tracing::info!(%addr, "Connected to XPAD server");
        self.conn = Some(Connection::new(stream));
        self.peer = Some(addr);
        Ok(())
    }

    /// Address of the connected server, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl<S> ProtocolClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already connected stream.
    pub fn from_stream(stream: S) -> Self {
        Self {
            conn: Some(Connection::new(stream)),
            peer: None,
        }
    }

    /// True until `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub(crate) fn connection_mut(&mut self) -> Result<&mut Connection<S>, ProtocolError> {
        self.conn.as_mut().ok_or(ProtocolError::NotConnected)
    }

    /// Send one command line. No response is consumed.
    pub async fn send(&mut self, line: &str) -> Result<(), ProtocolError> {
        let conn = self.connection_mut()?;
        tracing::debug!(command = line, "XPAD send");

        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');

        conn.write_all(&framed)
            .await
            .map_err(|source| ProtocolError::Send {
                command: line.to_string(),
                source,
            })
    }

    /// Consume events until the server prompt.
    pub async fn await_prompt(&mut self) -> Result<(), ProtocolError> {
        let conn = self.connection_mut()?;
        loop {
            match read_event(conn, NumericKind::Integer).await? {
                ResponseEvent::Prompt => return Ok(()),
                other => report_side_event("<prompt>", &other),
            }
        }
    }

    /// Read the integer result of a command that has already been sent.
    pub async fn await_integer(&mut self, command: &str) -> Result<i64, ProtocolError> {
        match self.await_reply(command, Expect::Integer).await? {
            Reply::Integer(value) => Ok(value),
            other => Err(ProtocolError::Malformed(format!("{other:?}"))),
        }
    }

    /// Read the float result of a command that has already been sent.
    pub async fn await_float(&mut self, command: &str) -> Result<f64, ProtocolError> {
        match self.await_reply(command, Expect::Float).await? {
            Reply::Float(value) => Ok(value),
            other => Err(ProtocolError::Malformed(format!("{other:?}"))),
        }
    }

    /// Read the string result of a command that has already been sent.
    pub async fn await_string(&mut self, command: &str) -> Result<String, ProtocolError> {
        match self.await_reply(command, Expect::Text).await? {
            Reply::Text(value) => Ok(value),
            other => Err(ProtocolError::Malformed(format!("{other:?}"))),
        }
    }

    /// Send a command and wait for its integer result.
    ///
    /// A `-1` result is followed by a string explaining the failure; it is read and
    /// returned as [`ProtocolError::Failed`].
    pub async fn send_and_await_integer(&mut self, line: &str) -> Result<i64, ProtocolError> {
        self.send(line).await?;
        self.await_integer(line).await
    }

    /// Send a command and wait for its float result.
    pub async fn send_and_await_float(&mut self, line: &str) -> Result<f64, ProtocolError> {
        self.send(line).await?;
        self.await_float(line).await
    }

    /// Send a command and wait for its string result.
    ///
    /// Numeric results are returned as their decimal text, except the `-1` sentinel,
    /// whose trailing string becomes the result.
    pub async fn send_and_await_string(&mut self, line: &str) -> Result<String, ProtocolError> {
        self.send(line).await?;
        self.await_string(line).await
    }

    /// Send a command whose integer result is a status code.
    ///
    /// `0` is success, `1` is [`XpadError::DetectorBusy`], anything else
    /// [`XpadError::DetectorRejected`].
    pub async fn send_and_check(&mut self, line: &str) -> XpadResult<()> {
        let code = self.send_and_await_integer(line).await?;
        XpadError::check_status(line, code)
    }

    /// Shut down and drop the connection. Safe to call when already disconnected.
    pub async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.shutdown().await {
                tracing::debug!(error = %e, "Socket shutdown failed");
            }
            tracing::info!(peer = ?self.peer, "Disconnected from XPAD server");
        }
        self.peer = None;
    }

    async fn await_reply(&mut self, command: &str, expect: Expect) -> Result<Reply, ProtocolError> {
        let mut last_error: Option<String> = None;
        let mut string_follows = false;

        loop {
            let numeric = match expect {
                Expect::Float if !string_follows => NumericKind::Float,
                _ => NumericKind::Integer,
            };

            let reply = match read_event(self.connection_mut()?, numeric).await? {
                ResponseEvent::Prompt => {
                    return Err(ProtocolError::NoResult {
                        command: command.to_string(),
                        last_error,
                    });
                }
                ResponseEvent::IntegerResult(STRING_FOLLOWS) if !string_follows => {
                    string_follows = true;
                    continue;
                }
                ResponseEvent::IntegerResult(value) => Reply::Integer(value),
                ResponseEvent::FloatResult(value) => Reply::Float(value),
                ResponseEvent::StringResult(text) => Reply::Text(text),
                ResponseEvent::ErrorMessage(message) => {
                    report_side_event(command, &ResponseEvent::ErrorMessage(message.clone()));
                    last_error = Some(message);
                    continue;
                }
                other => {
                    report_side_event(command, &other);
                    continue;
                }
            };
            tracing::debug!(command, result = ?reply, "XPAD result");

            if string_follows {
                let message = reply.into_text();
                return match expect {
                    Expect::Text => Ok(Reply::Text(message)),
                    Expect::Integer | Expect::Float => Err(ProtocolError::Failed {
                        command: command.to_string(),
                        message,
                    }),
                };
            }
            return reply.coerce(expect);
        }
    }
}

impl Reply {
    fn into_text(self) -> String {
        match self {
            Reply::Integer(value) => value.to_string(),
            Reply::Float(value) => value.to_string(),
            Reply::Text(text) => text,
        }
    }

    fn coerce(self, expect: Expect) -> Result<Reply, ProtocolError> {
        match (self, expect) {
            (Reply::Integer(value), Expect::Float) => Ok(Reply::Float(value as f64)),
            (Reply::Float(value), Expect::Integer) => {
                Err(ProtocolError::Malformed(format!("*{value}")))
            }
            (Reply::Text(text), Expect::Integer) => text
                .trim()
                .parse::<i64>()
                .map(Reply::Integer)
                .map_err(|_| ProtocolError::Malformed(text)),
            (Reply::Text(text), Expect::Float) => text
                .trim()
                .parse::<f64>()
                .map(Reply::Float)
                .map_err(|_| ProtocolError::Malformed(text)),
            (reply, Expect::Text) => Ok(Reply::Text(reply.into_text())),
            (reply, _) => Ok(reply),
        }
    }
}

fn report_side_event(command: &str, event: &ResponseEvent) {
    match event {
        ResponseEvent::ErrorMessage(message) => {
            tracing::warn!(command, message = %message.trim(), "XPAD server error");
        }
        ResponseEvent::DebugMessage(message) => {
            tracing::debug!(command, message = %message.trim(), "XPAD server debug");
        }
        ResponseEvent::Progress { done, total } => {
            tracing::debug!(command, done, total, "XPAD progress");
        }
        ResponseEvent::Unrecognized(line) => {
            tracing::warn!(command, line = %line, "Unrecognized XPAD response");
        }
        other => {
            tracing::debug!(command, event = %other, "Ignoring XPAD response");
        }
    }
}

//! Response-line classification.
//!
//! Every logical line the server writes starts with a marker character:
//!
//! | Marker | Meaning |
//! |---|---|
//! | `>` | prompt, the server is waiting for a command |
//! | `!` | error message |
//! | `#` | debug message |
//! | `@` | progress, `"<done> <total>"` with an optional quoted trailer |
//! | `*` | command result: `*(null)`, `*"text"`, or a number (`nan` allowed) |
//!
//! [`read_event`] consumes exactly one line and leaves the connection positioned at
//! the start of the next one.

use super::connection::Connection;
use crate::error::ProtocolError;
use std::fmt;
use std::io;
use tokio::io::AsyncRead;

/// Longest prefix of an unrecognized line that is kept for logging.
pub const MAX_UNRECOGNIZED_LEN: usize = 256;

/// One classified response line.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// `> `: the server is waiting for a command.
    Prompt,
    /// `!`: server-side error text, usually followed by a prompt.
    ErrorMessage(String),
    /// `#`: informational output.
    DebugMessage(String),
    /// `@<done> <total>`: progress of a long-running command.
    Progress {
        /// Steps finished.
        done: u64,
        /// Total steps.
        total: u64,
    },
    /// `*` followed by an integer.
    IntegerResult(i64),
    /// `*` followed by a float, or `*nan`.
    FloatResult(f64),
    /// `*"text"`; `*(` with nothing useful after it reads as an empty string.
    StringResult(String),
    /// Anything else, truncated to [`MAX_UNRECOGNIZED_LEN`] bytes.
    Unrecognized(String),
}

/// How a numeric `*` result should be interpreted.
///
/// The wire format does not distinguish integers from floats, so the caller decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumericKind {
    /// Parse as `i64`.
    #[default]
    Integer,
    /// `*nan` is accepted.
    Float,
}

impl ResponseEvent {
    /// True for events that end a command exchange.
    pub fn is_result(&self) -> bool {
        matches!(
            self,
            ResponseEvent::IntegerResult(_)
                | ResponseEvent::FloatResult(_)
                | ResponseEvent::StringResult(_)
        )
    }

    /// Render the event back into its wire form.
    pub fn to_wire(&self) -> String {
        match self {
            ResponseEvent::Prompt => "> ".to_string(),
            ResponseEvent::ErrorMessage(text) => format!("!{text}\n"),
            ResponseEvent::DebugMessage(text) => format!("#{text}\n"),
            ResponseEvent::Progress { done, total } => format!("@{done} {total}\n"),
            ResponseEvent::IntegerResult(value) => format!("*{value}\n"),
            ResponseEvent::FloatResult(value) if value.is_nan() => "*nan\n".to_string(),
            ResponseEvent::FloatResult(value) => format!("*{value}\n"),
            ResponseEvent::StringResult(text) => format!("*\"{text}\"\n"),
            ResponseEvent::Unrecognized(text) => format!("{text}\n"),
        }
    }
}

impl fmt::Display for ResponseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_wire().trim_end_matches('\n'))
    }
}

fn map_read_error(err: io::Error) -> ProtocolError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Read(err)
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Read and classify one response line.
///
/// Leading CR/LF bytes are skipped. Errors are reserved for transport failures and
/// numeric results that cannot be parsed; anything merely unexpected comes back as
/// [`ResponseEvent::Unrecognized`].
pub async fn read_event<S>(
    conn: &mut Connection<S>,
    numeric: NumericKind,
) -> Result<ResponseEvent, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let marker = loop {
        let byte = conn.read_u8().await.map_err(map_read_error)?;
        if byte != b'\r' && byte != b'\n' {
            break byte;
        }
    };

    match marker {
        b'>' => {
            conn.read_u8().await.map_err(map_read_error)?;
            Ok(ResponseEvent::Prompt)
        }
        b'!' => {
            let line = conn.read_line(usize::MAX).await.map_err(map_read_error)?;
            Ok(ResponseEvent::ErrorMessage(lossy(&line)))
        }
        b'#' => {
            let line = conn.read_line(usize::MAX).await.map_err(map_read_error)?;
            Ok(ResponseEvent::DebugMessage(lossy(&line)))
        }
        b'@' => {
            let line = conn.read_line(usize::MAX).await.map_err(map_read_error)?;
            parse_progress(&lossy(&line))
        }
        b'*' => read_result(conn, numeric).await,
        other => {
            let rest = conn
                .read_line(MAX_UNRECOGNIZED_LEN.saturating_sub(1))
                .await
                .map_err(map_read_error)?;
            let mut text = String::with_capacity(rest.len() + 1);
            text.push(char::from(other));
            text.push_str(&String::from_utf8_lossy(&rest));
            Ok(ResponseEvent::Unrecognized(text))
        }
    }
}

async fn read_result<S>(
    conn: &mut Connection<S>,
    numeric: NumericKind,
) -> Result<ResponseEvent, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let kind = conn.read_u8().await.map_err(map_read_error)?;
    match kind {
        b'(' => {
            conn.read_line(0).await.map_err(map_read_error)?;
            Ok(ResponseEvent::StringResult(String::new()))
        }
        b'"' => {
            let text = conn
                .read_until(b'"', usize::MAX)
                .await
                .map_err(map_read_error)?;
            conn.read_line(0).await.map_err(map_read_error)?;
            Ok(ResponseEvent::StringResult(lossy(&text)))
        }
        b'0'..=b'9' | b'-' | b'n' => {
            let rest = conn.read_line(usize::MAX).await.map_err(map_read_error)?;
            let mut token = String::with_capacity(rest.len() + 1);
            token.push(char::from(kind));
            token.push_str(&String::from_utf8_lossy(&rest));
            parse_number(token.trim(), numeric)
        }
        b'\n' => Ok(ResponseEvent::Unrecognized("*".to_string())),
        other => {
            let rest = conn
                .read_line(MAX_UNRECOGNIZED_LEN.saturating_sub(2))
                .await
                .map_err(map_read_error)?;
            let mut text = String::from("*");
            text.push(char::from(other));
            text.push_str(&String::from_utf8_lossy(&rest));
            Ok(ResponseEvent::Unrecognized(text))
        }
    }
}

fn parse_number(token: &str, numeric: NumericKind) -> Result<ResponseEvent, ProtocolError> {
    match numeric {
        NumericKind::Integer => token
            .parse::<i64>()
            .map(ResponseEvent::IntegerResult)
            .map_err(|_| ProtocolError::Malformed(format!("*{token}"))),
        NumericKind::Float if token.eq_ignore_ascii_case("nan") => {
            Ok(ResponseEvent::FloatResult(f64::NAN))
        }
        NumericKind::Float => token
            .parse::<f64>()
            .map(ResponseEvent::FloatResult)
            .map_err(|_| ProtocolError::Malformed(format!("*{token}"))),
    }
}

fn parse_progress(body: &str) -> Result<ResponseEvent, ProtocolError> {
    let mut tokens = body.split_whitespace();
    let done = tokens.next().and_then(|t| t.parse::<u64>().ok());
    let total = tokens.next().and_then(|t| t.parse::<u64>().ok());
    match (done, total) {
        (Some(done), Some(total)) => Ok(ResponseEvent::Progress { done, total }),
        _ => Err(ProtocolError::Malformed(format!("@{body}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(bytes: &[u8], numeric: NumericKind) -> Result<ResponseEvent, ProtocolError> {
        let mut conn = Connection::new(bytes);
        read_event(&mut conn, numeric).await
    }

    #[tokio::test]
    async fn classifies_progress() {
        let event = parse(b"@ 5 10\n", NumericKind::Integer).await.unwrap();
        assert_eq!(event, ResponseEvent::Progress { done: 5, total: 10 });

        let event = parse(b"@3 7 \"Loading\"\n", NumericKind::Integer)
            .await
            .unwrap();
        assert_eq!(event, ResponseEvent::Progress { done: 3, total: 7 });
    }

    #[tokio::test]
    async fn classifies_results() {
        let event = parse(b"*\"ABC\"\n", NumericKind::Integer).await.unwrap();
        assert_eq!(event, ResponseEvent::StringResult("ABC".into()));

        let event = parse(b"*(null)\n", NumericKind::Integer).await.unwrap();
        assert_eq!(event, ResponseEvent::StringResult(String::new()));

        let event = parse(b"*-1\n", NumericKind::Integer).await.unwrap();
        assert_eq!(event, ResponseEvent::IntegerResult(-1));

        let event = parse(b"*2.5\r\n", NumericKind::Float).await.unwrap();
        assert_eq!(event, ResponseEvent::FloatResult(2.5));
    }

    #[tokio::test]
    async fn nan_is_float_only() {
        match parse(b"*nan\n", NumericKind::Float).await.unwrap() {
            ResponseEvent::FloatResult(v) => assert!(v.is_nan()),
            other => panic!("unexpected event: {other:?}"),
        }

        let err = parse(b"*nan\n", NumericKind::Integer).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[tokio::test]
    async fn skips_leading_line_breaks_and_leaves_next_line() {
        let mut conn = Connection::new(&b"\r\n\n> *0\n"[..]);
        assert_eq!(
            read_event(&mut conn, NumericKind::Integer).await.unwrap(),
            ResponseEvent::Prompt
        );
        assert_eq!(
            read_event(&mut conn, NumericKind::Integer).await.unwrap(),
            ResponseEvent::IntegerResult(0)
        );
    }

    #[tokio::test]
    async fn unrecognized_lines_are_capped() {
        let mut line = vec![b'x'; 1000];
        line.push(b'\n');
        line.extend_from_slice(b"*7\n");
        let mut conn = Connection::new(&line[..]);

        match read_event(&mut conn, NumericKind::Integer).await.unwrap() {
            ResponseEvent::Unrecognized(text) => assert_eq!(text.len(), MAX_UNRECOGNIZED_LEN),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            read_event(&mut conn, NumericKind::Integer).await.unwrap(),
            ResponseEvent::IntegerResult(7)
        );
    }

    #[tokio::test]
    async fn text_payloads_round_trip() {
        let events = [
            ResponseEvent::ErrorMessage(" Module 3 not responding".into()),
            ResponseEvent::DebugMessage("ITHL=25".into()),
            ResponseEvent::StringResult("XPAD_S1400 v2".into()),
        ];
        for event in events {
            let wire = event.to_wire();
            let parsed = parse(wire.as_bytes(), NumericKind::Integer).await.unwrap();
            assert_eq!(parsed, event);
        }
    }

    #[tokio::test]
    async fn closed_stream_is_fatal() {
        let err = parse(b"", NumericKind::Integer).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));

        let err = parse(b"!half a line", NumericKind::Integer)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }
}

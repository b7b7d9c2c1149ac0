//! Side-channel status queries.
//!
//! The engine worker holds the primary connection for the whole length of a job, so
//! status and abort requests go over a second connection owned by [`StatusPoller`].
//! Nothing here ever waits on the worker.

use crate::error::{XpadError, XpadResult};
use crate::protocol::ProtocolClient;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Server state reported by `GetDetectorStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DetectorState {
    /// Ready for a command.
    #[default]
    Idle,
    /// Running an exposure.
    Acquiring,
    /// Loading or saving a calibration.
    CalibrationManipulation,
    /// Running a calibration.
    Calibrating,
    /// Running `DigitalTest`.
    DigitalTest,
    /// Running `ResetDetector`.
    Resetting,
}

impl DetectorState {
    /// Name as sent by the server.
    pub fn wire_name(self) -> &'static str {
        match self {
            DetectorState::Idle => "Idle",
            DetectorState::Acquiring => "Acquiring",
            DetectorState::CalibrationManipulation => "Loading/Saving_calibration",
            DetectorState::Calibrating => "Calibrating",
            DetectorState::DigitalTest => "Digital_Test",
            DetectorState::Resetting => "Resetting",
        }
    }
}

impl FromStr for DetectorState {
    type Err = XpadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Idle" => Ok(DetectorState::Idle),
            "Acquiring" => Ok(DetectorState::Acquiring),
            "Loading/Saving_calibration" => Ok(DetectorState::CalibrationManipulation),
            "Calibrating" => Ok(DetectorState::Calibrating),
            "Digital_Test" => Ok(DetectorState::DigitalTest),
            "Resetting" => Ok(DetectorState::Resetting),
            other => Err(XpadError::DetectorFailure(format!(
                "unknown detector state '{other}'"
            ))),
        }
    }
}

impl fmt::Display for DetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Snapshot of the detector state.
///
/// The frame fields are only meaningful outside [`DetectorState::Idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DetectorStatus {
    /// What the server is doing.
    pub state: DetectorState,
    /// Frame being acquired, when reported.
    pub frame_number: Option<u64>,
    /// Frames finished so far, when reported.
    pub completed_frames: Option<u64>,
}

impl DetectorStatus {
    /// Parse `"<State>[.<frame>.<completed>]"`.
    pub fn parse(reply: &str) -> XpadResult<Self> {
        let mut fields = reply.trim().split('.');
        let state = fields.next().unwrap_or_default().parse::<DetectorState>()?;
        let frame_number = fields.next().and_then(|f| f.trim().parse().ok());
        let completed_frames = fields.next().and_then(|f| f.trim().parse().ok());
        Ok(Self {
            state,
            frame_number,
            completed_frames,
        })
    }
}

/// Owner of the secondary connection.
pub struct StatusPoller<S = TcpStream> {
    client: Mutex<ProtocolClient<S>>,
    last: parking_lot::Mutex<DetectorStatus>,
}

impl<S> StatusPoller<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Take over an initialized secondary connection.
    pub fn new(client: ProtocolClient<S>) -> Self {
        Self {
            client: Mutex::new(client),
            last: parking_lot::Mutex::new(DetectorStatus::default()),
        }
    }

    /// Query the server state.
    ///
    /// An unrecognized state name leaves the previous state in place.
    pub async fn status(&self) -> XpadResult<DetectorStatus> {
        let reply = self
            .client
            .lock()
            .await
            .send_and_await_string("GetDetectorStatus")
            .await?;

        let mut last = self.last.lock();
        match DetectorStatus::parse(&reply) {
            Ok(status) => *last = status,
            Err(e) => tracing::warn!(reply = %reply, error = %e, "Keeping previous detector state"),
        }
        Ok(*last)
    }

    /// Most recent status without querying the server.
    pub fn last_status(&self) -> DetectorStatus {
        *self.last.lock()
    }

    /// Ask the server to abort whatever it is doing. Does not wait for a reply.
    pub async fn abort_current_process(&self) -> XpadResult<()> {
        tracing::info!("Sending AbortCurrentProcess");
        self.send_no_wait("AbortCurrentProcess").await
    }

    /// Send without reading a reply.
    pub async fn send_no_wait(&self, line: &str) -> XpadResult<()> {
        Ok(self.client.lock().await.send(line).await?)
    }

    /// Send and return the integer result.
    pub async fn command_int(&self, line: &str) -> XpadResult<i64> {
        Ok(self.client.lock().await.send_and_await_integer(line).await?)
    }

    /// Send and return the string result.
    pub async fn command_string(&self, line: &str) -> XpadResult<String> {
        Ok(self.client.lock().await.send_and_await_string(line).await?)
    }

    /// Send and require result code 0.
    pub async fn command_checked(&self, line: &str) -> XpadResult<()> {
        self.client.lock().await.send_and_check(line).await
    }

    /// Close the secondary connection.
    pub async fn disconnect(&self) {
        self.client.lock().await.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn parses_state_and_counters() {
        let status = DetectorStatus::parse("Acquiring.3.2").unwrap();
        assert_eq!(status.state, DetectorState::Acquiring);
        assert_eq!(status.frame_number, Some(3));
        assert_eq!(status.completed_frames, Some(2));

        let status = DetectorStatus::parse("Loading/Saving_calibration").unwrap();
        assert_eq!(status.state, DetectorState::CalibrationManipulation);
        assert_eq!(status.frame_number, None);

        assert!(DetectorStatus::parse("Sleeping").is_err());
    }

    #[test]
    fn wire_names_round_trip() {
        for state in [
            DetectorState::Idle,
            DetectorState::Acquiring,
            DetectorState::CalibrationManipulation,
            DetectorState::Calibrating,
            DetectorState::DigitalTest,
            DetectorState::Resetting,
        ] {
            assert_eq!(state.wire_name().parse::<DetectorState>().unwrap(), state);
        }
    }

    #[tokio::test]
    async fn unknown_state_keeps_previous() {
        let (client_end, server_end) = tokio::io::duplex(256);
        let poller = StatusPoller::new(ProtocolClient::from_stream(client_end));

        let server = tokio::spawn(async move {
            let mut reader = BufReader::new(server_end);
            let mut line = String::new();
            for reply in ["*\"Calibrating.0.0\"\n", "*\"Warming_up\"\n"] {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                assert_eq!(line, "GetDetectorStatus\n");
                reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });

        assert_eq!(poller.status().await.unwrap().state, DetectorState::Calibrating);
        assert_eq!(poller.status().await.unwrap().state, DetectorState::Calibrating);
        server.await.unwrap();
    }
}

//! Error types for the XPAD driver.
//!
//! Errors are layered the same way the transport is layered:
//!
//! - **`ConnectionError`**: establishing a socket failed. Unrecoverable, never retried.
//! - **`ProtocolError`**: a command could not be sent, or its response was malformed,
//!   missing, or cut off by the peer. Fails the current job.
//! - **`FrameError`**: the binary frame sub-protocol failed. `FrameError::NoFrame` is
//!   the expected end-of-exposure marker and is not treated as a failure by the engine.
//! - **`XpadError`**: the top-level type returned by the engine and the detector facade.
//!   It wraps the three transport errors with `#[from]` and adds the detector-reported
//!   outcomes (`DetectorBusy`, `DetectorRejected`) and caller errors (`EngineBusy`).
//!
//! By using `#[from]`, lower-level errors flow into `XpadError` through `?`.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type XpadResult<T> = std::result::Result<T, XpadError>;

/// Failure to establish a connection to the detector server.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// `connect` called on a connected client.
    #[error("Client is already connected")]
    AlreadyConnected,

    /// The host name did not resolve to any address.
    #[error("Failed to resolve host '{host}': {source}")]
    ResolutionFailed {
        /// Host as configured.
        host: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Creating the TCP socket failed.
    #[error("Failed to create socket: {0}")]
    SocketCreateFailed(#[source] io::Error),

    /// The server refused the connection or could not be reached.
    #[error("Connection to {addr} refused or unreachable: {source}")]
    RefusedOrUnreachable {
        /// Address tried.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// No connection within the configured timeout.
    #[error("Connection to {addr} timed out")]
    TimedOut {
        /// Address tried.
        addr: SocketAddr,
    },

    /// Setting `TCP_NODELAY` failed.
    #[error("Failed to set socket option: {0}")]
    OptionSetFailed(#[source] io::Error),
}

/// Failure while exchanging command lines with the detector server.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// No connection is open.
    #[error("Not connected to the detector server")]
    NotConnected,

    /// Writing a command line failed.
    #[error("Failed to send '{command}': {source}")]
    Send {
        /// Command line that failed.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// End of stream while waiting for a response.
    #[error("Connection closed by the detector server")]
    ConnectionClosed,

    /// Reading a response failed.
    #[error("Failed to read response: {0}")]
    Read(#[source] io::Error),

    /// The server returned to its prompt without producing a return value.
    #[error("Command '{command}' produced no result{}", last_error_suffix(.last_error))]
    NoResult {
        /// Command line that failed.
        command: String,
        /// Last `!` line seen before the prompt.
        last_error: Option<String>,
    },

    /// A result of the wrong kind or an unparsable number.
    #[error("Malformed response: {0:?}")]
    Malformed(String),

    /// The server answered with the `-1` sentinel followed by an explanation.
    #[error("Command '{command}' failed: {message}")]
    Failed {
        /// Command line that failed.
        command: String,
        /// Explanation sent after the `-1` sentinel.
        message: String,
    },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(message) => format!(" (last error: {message})"),
        None => String::new(),
    }
}

/// Failure in the binary frame sub-protocol.
#[derive(Error, Debug)]
pub enum FrameError {
    /// No frame is available; the exposure is over.
    #[error("No frame available")]
    NoFrame,

    /// Reading the 12-byte header failed.
    #[error("Failed to read frame header: {0}")]
    HeaderReadFailed(#[source] io::Error),

    /// Reading the pixel payload failed.
    #[error("Failed to read frame payload: {0}")]
    PayloadReadFailed(#[source] io::Error),

    /// Writing the `\n` acknowledgement failed.
    #[error("Failed to acknowledge frame: {0}")]
    AckFailed(#[source] io::Error),

    /// Header length is not `rows * columns * 4`.
    #[error("Frame payload of {byte_length} bytes does not match {rows}x{columns} pixels")]
    SizeMismatch {
        /// Announced payload length.
        byte_length: u32,
        /// Announced rows.
        rows: u32,
        /// Announced columns.
        columns: u32,
    },

    /// Header announces more than [`crate::frame::MAX_FRAME_LEN`] bytes.
    #[error("Frame of {byte_length} bytes exceeds the {limit}-byte limit")]
    TooLarge {
        /// Announced payload length.
        byte_length: u32,
        /// Accepted maximum.
        limit: u32,
    },

    /// A frame file could not be read in file-transfer mode.
    #[error("Failed to read frame file {path}: {source}")]
    FileReadFailed {
        /// Frame file path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl FrameError {
    /// True for the end-of-exposure marker.
    pub fn is_no_frame(&self) -> bool {
        matches!(self, FrameError::NoFrame)
    }
}

/// Primary error type for the driver.
///
/// # Error Categories
///
/// 1. **Transport errors** - `Connection`, `Protocol`, `Frame`, `Io`
///    - Abort the current job; the engine records the failure and returns to idle.
///
/// 2. **Detector-reported errors** - `DetectorBusy`, `DetectorRejected`
///    - The server understood the command and refused or failed it.
///    - Fatal to the current job only.
///
/// 3. **Caller errors** - `EngineBusy`, `EngineStopped`, `InvalidParameter`, `Config`
#[derive(Error, Debug)]
pub enum XpadError {
    /// Connecting failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Command exchange failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Frame transfer failed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Local file system error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Loaded configuration failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Result code 1.
    #[error("Detector busy while executing '{command}'")]
    DetectorBusy {
        /// Command line that failed.
        command: String,
    },

    /// Any result code other than 0 or 1.
    #[error("Detector rejected '{command}' with code {code}")]
    DetectorRejected {
        /// Command line that failed.
        command: String,
        /// Result code returned by the server.
        code: i64,
    },

    /// Unexpected reply content.
    #[error("Detector reported failure: {0}")]
    DetectorFailure(String),

    /// A job is already running.
    #[error("Acquisition engine is busy with another job")]
    EngineBusy,

    /// The engine worker is gone.
    #[error("Acquisition engine worker has stopped")]
    EngineStopped,

    /// Rejected locally before anything was sent.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl From<figment::Error> for XpadError {
    fn from(value: figment::Error) -> Self {
        XpadError::Config(Box::new(value))
    }
}

impl XpadError {
    /// Map a checked status code: `0` is success, `1` is busy, anything else is a rejection.
    pub fn check_status(command: &str, code: i64) -> XpadResult<()> {
        match code {
            0 => Ok(()),
            1 => Err(XpadError::DetectorBusy {
                command: command.to_string(),
            }),
            other => Err(XpadError::DetectorRejected {
                command: command.to_string(),
                code: other,
            }),
        }
    }

    /// True when the failure came from the transport rather than the detector.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            XpadError::Connection(_) | XpadError::Protocol(_) | XpadError::Frame(_) | XpadError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_status_maps_known_codes() {
        assert!(XpadError::check_status("AskReady", 0).is_ok());

        match XpadError::check_status("AskReady", 1) {
            Err(XpadError::DetectorBusy { command }) => assert_eq!(command, "AskReady"),
            other => panic!("unexpected result: {:?}", other),
        }

        match XpadError::check_status("Init", -3) {
            Err(XpadError::DetectorRejected { code, .. }) => assert_eq!(code, -3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn no_result_message_includes_last_error() {
        let err = ProtocolError::NoResult {
            command: "Bogus".into(),
            last_error: Some("unknown command".into()),
        };
        let text = err.to_string();
        assert!(text.contains("Bogus"));
        assert!(text.contains("unknown command"));
    }

    #[test]
    fn transport_classification() {
        let err: XpadError = ProtocolError::ConnectionClosed.into();
        assert!(err.is_transport());
        assert!(!XpadError::EngineBusy.is_transport());
        assert!(FrameError::NoFrame.is_no_frame());
    }
}

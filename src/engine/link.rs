//! Detector operations the engine worker depends on.
//!
//! The worker talks to the detector only through [`DetectorLink`], so engine tests can
//! drive it with a scripted stub instead of a socket.

use super::{TransferMode, START_EXPOSURE};
use crate::error::{FrameError, ProtocolError, XpadResult};
use crate::frame::{self, Frame, PixelDepth};
use crate::protocol::ProtocolClient;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

/// Command and frame channel of the primary connection.
#[async_trait]
pub trait DetectorLink: Send {
    /// Send a command and return its integer result.
    async fn command_int(&mut self, line: &str) -> XpadResult<i64>;

    /// Send a command and return its string result.
    async fn command_string(&mut self, line: &str) -> XpadResult<String>;

    /// Send a command without reading any response.
    async fn send_line(&mut self, line: &str) -> XpadResult<()>;

    /// Read the integer completion code of a command sent earlier with [`send_line`].
    ///
    /// [`send_line`]: DetectorLink::send_line
    async fn await_completion(&mut self, command: &str) -> XpadResult<i64>;

    /// Receive the next binary frame.
    async fn pull_frame(
        &mut self,
        depth: PixelDepth,
        sequence_number: u64,
    ) -> Result<Frame, FrameError>;

    /// Send `command` followed by the contents of `path`; returns the completion code.
    async fn upload_config(&mut self, command: &str, path: &Path) -> XpadResult<i64>;

    /// Send `command` and store the returned payload at `path`; returns the completion code.
    async fn download_config(&mut self, command: &str, path: &Path) -> XpadResult<i64>;

    /// Read what a locally stopped exposure left behind: in direct mode every frame
    /// until the server signals the end, then the `StartExposure` completion code.
    ///
    /// Blocks until the server finishes; send `AbortCurrentProcess` first.
    async fn recover_exposure(
        &mut self,
        transfer: TransferMode,
        depth: PixelDepth,
    ) -> XpadResult<i64> {
        if transfer == TransferMode::Direct {
            let mut discarded = 0u64;
            loop {
                match self.pull_frame(depth, 0).await {
                    Ok(_) => discarded += 1,
                    Err(FrameError::NoFrame) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            if discarded > 0 {
                tracing::debug!(discarded, "Discarded frames of interrupted exposure");
            }
        }
        self.await_completion(START_EXPOSURE).await
    }
}

#[async_trait]
impl<S> DetectorLink for ProtocolClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn command_int(&mut self, line: &str) -> XpadResult<i64> {
        Ok(self.send_and_await_integer(line).await?)
    }

    async fn command_string(&mut self, line: &str) -> XpadResult<String> {
        Ok(self.send_and_await_string(line).await?)
    }

    async fn send_line(&mut self, line: &str) -> XpadResult<()> {
        Ok(self.send(line).await?)
    }

    async fn await_completion(&mut self, command: &str) -> XpadResult<i64> {
        Ok(self.await_integer(command).await?)
    }

    async fn pull_frame(
        &mut self,
        depth: PixelDepth,
        sequence_number: u64,
    ) -> Result<Frame, FrameError> {
        let conn = self.connection_mut().map_err(|e: ProtocolError| {
            FrameError::HeaderReadFailed(io::Error::new(io::ErrorKind::NotConnected, e))
        })?;
        frame::pull_frame(conn, depth, sequence_number).await
    }

    async fn upload_config(&mut self, command: &str, path: &Path) -> XpadResult<i64> {
        self.upload_file(command, path).await
    }

    async fn download_config(&mut self, command: &str, path: &Path) -> XpadResult<i64> {
        self.download_file(command, path).await
    }
}

//! # XPAD DAQ Library
//!
//! Client-side driver for XPAD hybrid-pixel area detectors controlled by a remote
//! XPAD server over TCP. The library talks the server's line-oriented command protocol,
//! receives binary frames (or picks them up from the server's output directory) and
//! runs acquisitions and calibrations on a background worker.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: Buffered connection, response classification and the command
//!   client (`ProtocolClient`), plus configuration-file transfers.
//! - **`frame`**: Frame header codec, pixel narrowing and frame-file decoding.
//! - **`engine`**: The acquisition worker. Jobs (exposures, calibrations, threshold
//!   changes) run one at a time and can be cancelled from any task.
//! - **`status`**: Status and abort requests over the secondary connection.
//! - **`detector`**: `XpadDetector`, the high-level handle combining all of the above.
//! - **`config`**: Layered configuration (defaults, TOML file, `XPAD_` environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: `XpadError` and the transport-level error types.

pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod frame;
pub mod logging;
pub mod protocol;
pub mod status;

pub use detector::{DetectorInfo, ExposureSettings, XpadDetector};
pub use error::{XpadError, XpadResult};
pub use frame::{Frame, FrameDescriptor, PixelData, PixelDepth};

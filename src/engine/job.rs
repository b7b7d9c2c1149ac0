//! Jobs accepted by the acquisition engine.

use crate::error::{XpadError, XpadResult};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory the server writes frame files to unless told otherwise.
pub const DEFAULT_OUTPUT_PATH: &str = "/opt/imXPAD/tmp_corrected/";

/// Output signal modes accepted by the detector.
pub const MAX_OUTPUT_SIGNAL_MODE: u8 = 8;

// =============================================================================
// Enumerations
// =============================================================================

/// Trigger source of an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Detector-timed exposures.
    #[default]
    Internal,
    /// Exposure follows an external gate signal.
    ExternalGate,
    /// One frame per external trigger.
    ExternalTriggerMultiple,
    /// One external trigger starts the whole sequence.
    ExternalTriggerSingle,
}

impl TriggerMode {
    /// Code sent in `SetExposureParameters`.
    pub fn wire_code(self) -> u8 {
        match self {
            TriggerMode::Internal => 0,
            TriggerMode::ExternalGate => 1,
            TriggerMode::ExternalTriggerMultiple => 2,
            TriggerMode::ExternalTriggerSingle => 3,
        }
    }
}

/// How frames travel from the server to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Binary frames on the command connection.
    #[default]
    Direct,
    /// Frame files in the server output directory.
    File,
}

impl TransferMode {
    /// Transfer flag of `SetExposureParameters`: 1 direct, 0 file.
    pub fn wire_flag(self) -> u8 {
        match self {
            TransferMode::Direct => 1,
            TransferMode::File => 0,
        }
    }
}

/// Speed/precision trade-off of a calibration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationConfig {
    /// Most steps, best precision.
    #[default]
    Slow,
    /// Intermediate step count.
    Medium,
    /// Fewest steps.
    Fast,
}

impl CalibrationConfig {
    /// Argument of the calibration commands.
    pub fn wire_code(self) -> u8 {
        match self {
            CalibrationConfig::Slow => 0,
            CalibrationConfig::Medium => 1,
            CalibrationConfig::Fast => 2,
        }
    }
}

/// Test pattern injected into the read-out chain by `DigitalTest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitalTestMode {
    /// Same value on every pixel.
    Flat,
    /// Alternating stripes.
    #[default]
    Strip,
    /// Values ramp across the image.
    Gradient,
}

impl DigitalTestMode {
    /// Argument of `DigitalTest`.
    pub fn wire_name(self) -> &'static str {
        match self {
            DigitalTestMode::Flat => "flat",
            DigitalTestMode::Strip => "strip",
            DigitalTestMode::Gradient => "gradient",
        }
    }
}

/// Image corrections applied by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CorrectionFlags {
    /// Remap pixels to the physical module geometry.
    pub geometrical: bool,
    /// Divide by the selected white image.
    pub flat_field: bool,
}

// =============================================================================
// Global registers
// =============================================================================

/// A global detector register and its factory value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    /// Name used in `LoadConfigG`/`ReadConfigG`.
    pub name: &'static str,
    /// Register number written to saved `.cfg` files.
    pub id: u16,
    /// Factory value written by `LoadDefaultGlobalConfig`.
    pub default_value: u16,
}

/// Global registers in the order they are written and saved.
pub const GLOBAL_REGISTERS: [Register; 7] = [
    Register { name: "AMPTP", id: 31, default_value: 0 },
    Register { name: "IMFP", id: 59, default_value: 50 },
    Register { name: "IOTA", id: 60, default_value: 40 },
    Register { name: "IPRE", id: 61, default_value: 60 },
    Register { name: "ITHL", id: 62, default_value: 25 },
    Register { name: "ITUNE", id: 63, default_value: 100 },
    Register { name: "IBUFF", id: 64, default_value: 0 },
];

/// Look up a global register by name, case-insensitively.
pub fn register_by_name(name: &str) -> Option<&'static Register> {
    GLOBAL_REGISTERS
        .iter()
        .find(|r| r.name.eq_ignore_ascii_case(name))
}

// =============================================================================
// Exposure parameters
// =============================================================================

/// Everything `SetExposureParameters` needs.
///
/// Construct with [`ExposureParams::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureParams {
    /// Number of frames; 0 means "until stopped".
    pub frame_count: u32,
    /// Integration time per frame.
    pub exposure_time: Duration,
    /// Dead time between frames.
    pub latency_time: Duration,
    /// Counter overflow read-out period.
    pub overflow_time: Duration,
    /// Trigger source.
    pub trigger_mode: TriggerMode,
    /// Output connector signal, `0..=8`.
    pub output_signal_mode: u8,
    /// Corrections applied on the server.
    pub corrections: CorrectionFlags,
    /// Socket or frame-file delivery.
    pub transfer_mode: TransferMode,
    /// Server file format code.
    pub file_format: u16,
    /// Server acquisition mode code.
    pub acquisition_mode: u16,
    /// Images summed per delivered frame.
    pub stack_size: u32,
    /// Server directory for frame files.
    pub output_path: PathBuf,
}

impl ExposureParams {
    /// Start from the default parameters.
    pub fn builder() -> ExposureParamsBuilder {
        ExposureParamsBuilder::default()
    }

    /// The full `SetExposureParameters` command line.
    pub fn command_line(&self) -> String {
        let mut path = self.output_path.display().to_string();
        if !path.ends_with('/') {
            path.push('/');
        }
        format!(
            "SetExposureParameters {} {} {} {} {} {} {} {} {} {} {} {} {}",
            self.frame_count,
            self.exposure_time.as_micros(),
            self.latency_time.as_micros(),
            self.overflow_time.as_micros(),
            self.trigger_mode.wire_code(),
            self.output_signal_mode,
            u8::from(self.corrections.geometrical),
            u8::from(self.corrections.flat_field),
            self.transfer_mode.wire_flag(),
            self.file_format,
            self.acquisition_mode,
            self.stack_size,
            path,
        )
    }
}

/// Builder for [`ExposureParams`]; starts from a one-frame, one-second internal-trigger exposure.
#[derive(Debug, Clone)]
pub struct ExposureParamsBuilder {
    params: ExposureParams,
}

impl Default for ExposureParamsBuilder {
    fn default() -> Self {
        Self {
            params: ExposureParams {
                frame_count: 1,
                exposure_time: Duration::from_secs(1),
                latency_time: Duration::ZERO,
                overflow_time: Duration::from_micros(4000),
                trigger_mode: TriggerMode::Internal,
                output_signal_mode: 0,
                corrections: CorrectionFlags::default(),
                transfer_mode: TransferMode::Direct,
                file_format: 1,
                acquisition_mode: 0,
                stack_size: 1,
                output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            },
        }
    }
}

impl ExposureParamsBuilder {
    /// Frames to acquire; 0 keeps going until stopped.
    pub fn frame_count(mut self, frames: u32) -> Self {
        self.params.frame_count = frames;
        self
    }

    /// Integration time of each frame.
    pub fn exposure_time(mut self, time: Duration) -> Self {
        self.params.exposure_time = time;
        self
    }

    /// Dead time between frames.
    pub fn latency_time(mut self, time: Duration) -> Self {
        self.params.latency_time = time;
        self
    }

    /// Counter overflow read-out period.
    pub fn overflow_time(mut self, time: Duration) -> Self {
        self.params.overflow_time = time;
        self
    }

    /// Trigger source.
    pub fn trigger_mode(mut self, mode: TriggerMode) -> Self {
        self.params.trigger_mode = mode;
        self
    }

    /// Signal on the detector's output connector, `0..=8`.
    pub fn output_signal_mode(mut self, mode: u8) -> Self {
        self.params.output_signal_mode = mode;
        self
    }

    /// Corrections the server applies before sending a frame.
    pub fn corrections(mut self, corrections: CorrectionFlags) -> Self {
        self.params.corrections = corrections;
        self
    }

    /// Socket or frame-file delivery.
    pub fn transfer_mode(mut self, mode: TransferMode) -> Self {
        self.params.transfer_mode = mode;
        self
    }

    /// Server-side file format code (1 is binary).
    pub fn file_format(mut self, format: u16) -> Self {
        self.params.file_format = format;
        self
    }

    /// Server acquisition mode code.
    pub fn acquisition_mode(mut self, mode: u16) -> Self {
        self.params.acquisition_mode = mode;
        self
    }

    /// Images summed into each delivered frame. Must be at least 1.
    pub fn stack_size(mut self, stack: u32) -> Self {
        self.params.stack_size = stack;
        self
    }

    /// Directory the server writes frame files to.
    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.params.output_path = path.into();
        self
    }

    /// Validate and produce the parameters.
    pub fn build(self) -> XpadResult<ExposureParams> {
        if self.params.output_signal_mode > MAX_OUTPUT_SIGNAL_MODE {
            return Err(XpadError::InvalidParameter(format!(
                "output signal mode {} unsupported (0..={MAX_OUTPUT_SIGNAL_MODE})",
                self.params.output_signal_mode
            )));
        }
        if self.params.stack_size == 0 {
            return Err(XpadError::InvalidParameter(
                "stack size must be at least 1".to_string(),
            ));
        }
        Ok(self.params)
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// One unit of work for the engine worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// Acquire frames.
    Exposure(ExposureParams),
    /// `CalibrationOTN`.
    CalibrationOverNoise {
        /// Speed/precision trade-off.
        config: CalibrationConfig,
    },
    /// `CalibrationOTNPulse`.
    CalibrationOverNoisePulsed {
        /// Speed/precision trade-off.
        config: CalibrationConfig,
    },
    /// `CalibrationBEAM` with a per-step exposure and ITHL ceiling.
    CalibrationBeam {
        /// Exposure per step.
        duration: Duration,
        /// Highest ITHL value tried.
        ithl_max: u32,
        /// Speed/precision trade-off.
        config: CalibrationConfig,
    },
    /// Upload `<path>.cfg` then `<path>.cfl`.
    LoadCalibration {
        /// Base path; see [`calibration_paths`].
        path: PathBuf,
    },
    /// Read back the global and local configuration into `<path>.cfg`/`.cfl`.
    SaveCalibration {
        /// Base path; see [`calibration_paths`].
        path: PathBuf,
    },
    /// Write factory values to every global register.
    LoadDefaultGlobalConfig,
    /// `ITHLIncrease`.
    IncrementThreshold,
    /// `ITHLDecrease`.
    DecrementThreshold,
    /// Same local configuration value on every pixel.
    LoadFlatLocalConfig {
        /// Local configuration value.
        value: u32,
    },
    /// Read one synthetic image with geometrical correction switched off.
    DigitalTest {
        /// Injected pattern.
        mode: DigitalTestMode,
    },
}

impl Job {
    /// Stable name used in reports and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Job::Exposure(_) => "exposure",
            Job::CalibrationOverNoise { .. } => "calibration_over_noise",
            Job::CalibrationOverNoisePulsed { .. } => "calibration_over_noise_pulsed",
            Job::CalibrationBeam { .. } => "calibration_beam",
            Job::LoadCalibration { .. } => "load_calibration",
            Job::SaveCalibration { .. } => "save_calibration",
            Job::LoadDefaultGlobalConfig => "load_default_global_config",
            Job::IncrementThreshold => "increment_threshold",
            Job::DecrementThreshold => "decrement_threshold",
            Job::LoadFlatLocalConfig { .. } => "load_flat_local_config",
            Job::DigitalTest { .. } => "digital_test",
        }
    }

    /// Command line for jobs that are a single integer-result command.
    pub(crate) fn single_command(&self) -> Option<String> {
        match self {
            Job::CalibrationOverNoise { config } => {
                Some(format!("CalibrationOTN {}", config.wire_code()))
            }
            Job::CalibrationOverNoisePulsed { config } => {
                Some(format!("CalibrationOTNPulse {}", config.wire_code()))
            }
            Job::CalibrationBeam {
                duration,
                ithl_max,
                config,
            } => Some(format!(
                "CalibrationBEAM {} {} {}",
                duration.as_micros(),
                ithl_max,
                config.wire_code()
            )),
            Job::IncrementThreshold => Some("ITHLIncrease".to_string()),
            Job::DecrementThreshold => Some("ITHLDecrease".to_string()),
            Job::LoadFlatLocalConfig { value } => Some(format!("LoadFlatConfigL {value}")),
            _ => None,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a job ended when the detector did not report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// The detector reported success (code 0).
    Completed,
    /// The detector reported the operation as aborted.
    Aborted,
    /// Stopped by a local cancellation request.
    Cancelled,
}

impl JobOutcome {
    /// Map the result code of a maintenance command.
    pub fn from_code(command: &str, code: i64) -> XpadResult<Self> {
        match code {
            0 => Ok(JobOutcome::Completed),
            1 => Ok(JobOutcome::Aborted),
            other => Err(XpadError::DetectorRejected {
                command: command.to_string(),
                code: other,
            }),
        }
    }
}

/// Global (`.cfg`) and local (`.cfl`) file paths of a calibration.
///
/// The first `.cf` in the path and the character after it become `.cfg`/`.cfl`;
/// anything after that is kept (`run.cfg.bak` gives `run.cfl.bak`). Without `.cf`
/// the suffix is appended.
pub fn calibration_paths(path: &Path) -> (PathBuf, PathBuf) {
    let with_suffix = |suffix: &str| {
        if let Some(text) = path.to_str() {
            if let Some(pos) = text.find(".cf") {
                let tail = pos + 3;
                let end = tail + text[tail..].chars().next().map_or(0, char::len_utf8);
                let mut name = String::with_capacity(text.len() + 1);
                name.push_str(&text[..pos]);
                name.push_str(suffix);
                name.push_str(&text[end..]);
                return PathBuf::from(name);
            }
        }
        let mut name = OsString::from(path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    };
    (with_suffix(".cfg"), with_suffix(".cfl"))
}

//! High-level detector handle.
//!
//! [`XpadDetector`] opens the two server connections, runs the `Init` handshake and
//! reads the detector description, then hands the primary connection to the
//! acquisition [`Engine`] and the secondary one to the [`StatusPoller`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use xpad_daq::config::XpadConfig;
//! use xpad_daq::detector::{ExposureSettings, XpadDetector};
//! use xpad_daq::engine::CollectingSink;
//!
//! # async fn run() -> xpad_daq::error::XpadResult<()> {
//! let sink = Arc::new(CollectingSink::new());
//! let detector = XpadDetector::connect(XpadConfig::load()?, sink.clone()).await?;
//!
//! detector.snap(ExposureSettings::default()).await?;
//! detector.wait_idle().await;
//! println!("{} frames", sink.len());
//!
//! detector.shutdown().await
//! # }
//! ```

use crate::config::{AcquisitionConfig, XpadConfig};
use crate::engine::{
    module_count, parse_register_reply, register_by_name, CalibrationConfig, DetectorLink,
    DigitalTestMode, Engine, EngineSettings, EngineState, ExposureParams, FrameSink, Job,
    JobReport, TransferMode, TriggerMode,
};
use crate::error::{ProtocolError, XpadError, XpadResult};
use crate::protocol::ProtocolClient;
use crate::status::{DetectorStatus, StatusPoller};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Description read from the server at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DetectorInfo {
    /// For example `XPAD_S70`.
    pub detector_type: String,
    /// Model name.
    pub model: String,
    /// Enabled modules.
    pub module_mask: u32,
    /// Enabled chips.
    pub chip_mask: u32,
    /// Modules present.
    pub module_count: u32,
    /// Chips per module.
    pub chip_count: u32,
    /// Burst number at connect time.
    pub burst_number: u64,
    /// Image height in pixels.
    pub image_rows: u32,
    /// Image width in pixels.
    pub image_columns: u32,
}

/// Per-snap exposure settings. Transfer, path and corrections come from
/// [`AcquisitionConfig`] unless overridden here.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureSettings {
    /// At least 1.
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
    /// Overrides `acquisition.image_transfer`.
    pub transfer_mode: Option<TransferMode>,
    /// Images summed per delivered frame.
    pub stack_size: u32,
    /// Server acquisition mode code.
    pub acquisition_mode: u16,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            frame_count: 1,
            exposure_time: Duration::from_secs(1),
            latency_time: Duration::from_micros(5000),
            overflow_time: Duration::from_micros(4000),
            trigger_mode: TriggerMode::Internal,
            output_signal_mode: 0,
            transfer_mode: None,
            stack_size: 1,
            acquisition_mode: 0,
        }
    }
}

impl ExposureSettings {
    /// Merge with the configured defaults and validate.
    pub fn into_params(self, acquisition: &AcquisitionConfig) -> XpadResult<ExposureParams> {
        ExposureParams::builder()
            .frame_count(self.frame_count)
            .exposure_time(self.exposure_time)
            .latency_time(self.latency_time)
            .overflow_time(self.overflow_time)
            .trigger_mode(self.trigger_mode)
            .output_signal_mode(self.output_signal_mode)
            .corrections(acquisition.corrections())
            .transfer_mode(self.transfer_mode.unwrap_or(acquisition.image_transfer))
            .file_format(acquisition.file_format)
            .acquisition_mode(self.acquisition_mode)
            .stack_size(self.stack_size)
            .output_path(acquisition.output_path.clone())
            .build()
    }
}

/// Connected XPAD detector.
pub struct XpadDetector<S = TcpStream> {
    config: XpadConfig,
    info: DetectorInfo,
    engine: Engine<ProtocolClient<S>>,
    poller: StatusPoller<S>,
}

impl XpadDetector<TcpStream> {
    /// Open both connections to the configured server and initialize the detector.
    pub async fn connect(config: XpadConfig, sink: Arc<dyn FrameSink>) -> XpadResult<Self> {
        let detector = &config.detector;
        let timeout = detector.connect_timeout();

        let mut primary = ProtocolClient::new();
        primary.connect(&detector.host, detector.port, timeout).await?;
        let mut secondary = ProtocolClient::new();
        secondary
            .connect(&detector.host, detector.port, timeout)
            .await?;

        Self::from_clients(config, primary, secondary, sink).await
    }
}

impl<S> XpadDetector<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Initialize over two already connected clients.
    pub async fn from_clients(
        config: XpadConfig,
        mut primary: ProtocolClient<S>,
        mut secondary: ProtocolClient<S>,
        sink: Arc<dyn FrameSink>,
    ) -> XpadResult<Self> {
        primary.await_prompt().await?;
        secondary.await_prompt().await?;

        init(&mut primary).await?;
        init(&mut secondary).await?;

        if config.detector.module_mask != 0 {
            let command = format!("SetModuleMask {}", config.detector.module_mask);
            let code = primary.send_and_await_integer(&command).await?;
            if code != 0 {
                return Err(XpadError::DetectorRejected { command, code });
            }
            tracing::info!(mask = config.detector.module_mask, "Module mask applied");
        }

        let info = read_info(&mut primary).await?;
        tracing::info!(
            detector_type = %info.detector_type,
            model = %info.model,
            modules = info.module_count,
            rows = info.image_rows,
            columns = info.image_columns,
            "Detector initialized"
        );

        let settings = EngineSettings {
            pixel_depth: config.acquisition.pixel_depth,
            image_rows: info.image_rows,
            image_columns: info.image_columns,
            module_mask: info.module_mask,
            burst_number: info.burst_number,
            file_poll_interval: config.acquisition.file_poll_interval(),
        };

        Ok(Self {
            engine: Engine::spawn(primary, sink, settings),
            poller: StatusPoller::new(secondary),
            config,
            info,
        })
    }

    /// Description read at connect time.
    pub fn info(&self) -> &DetectorInfo {
        &self.info
    }

    /// Configuration the detector was opened with.
    pub fn config(&self) -> &XpadConfig {
        &self.config
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Start an exposure once the engine is idle.
    ///
    /// Returns as soon as the job is accepted; frames go to the sink.
    pub async fn snap(&self, settings: ExposureSettings) -> XpadResult<()> {
        if settings.frame_count == 0 {
            return Err(XpadError::InvalidParameter(
                "frame_count must be at least 1; continuous acquisition is not supported"
                    .to_string(),
            ));
        }
        let params = settings.into_params(&self.config.acquisition)?;
        self.run_job(Job::Exposure(params)).await
    }

    /// Start an over-noise calibration.
    pub async fn calibrate_over_noise(&self, config: CalibrationConfig) -> XpadResult<()> {
        self.run_job(Job::CalibrationOverNoise { config }).await
    }

    /// Start an over-noise calibration with test pulses.
    pub async fn calibrate_over_noise_pulsed(&self, config: CalibrationConfig) -> XpadResult<()> {
        self.run_job(Job::CalibrationOverNoisePulsed { config }).await
    }

    /// Start a calibration under beam; `duration` is the exposure per step.
    pub async fn calibrate_beam(
        &self,
        duration: Duration,
        ithl_max: u32,
        config: CalibrationConfig,
    ) -> XpadResult<()> {
        self.run_job(Job::CalibrationBeam {
            duration,
            ithl_max,
            config,
        })
        .await
    }

    /// Upload the `.cfg`/`.cfl` pair named by `path`.
    pub async fn load_calibration(&self, path: impl Into<PathBuf>) -> XpadResult<()> {
        self.run_job(Job::LoadCalibration { path: path.into() }).await
    }

    /// Save the current calibration as a `.cfg`/`.cfl` pair.
    pub async fn save_calibration(&self, path: impl Into<PathBuf>) -> XpadResult<()> {
        self.run_job(Job::SaveCalibration { path: path.into() }).await
    }

    /// Reset global registers to their factory values.
    pub async fn load_default_global_config(&self) -> XpadResult<()> {
        self.run_job(Job::LoadDefaultGlobalConfig).await
    }

    /// One ITHL step up.
    pub async fn increase_threshold(&self) -> XpadResult<()> {
        self.run_job(Job::IncrementThreshold).await
    }

    /// One ITHL step down.
    pub async fn decrease_threshold(&self) -> XpadResult<()> {
        self.run_job(Job::DecrementThreshold).await
    }

    /// Load `value` as local configuration on every pixel.
    pub async fn load_flat_local_config(&self, value: u32) -> XpadResult<()> {
        self.run_job(Job::LoadFlatLocalConfig { value }).await
    }

    /// Read one synthetic `mode` image with geometrical correction off.
    pub async fn digital_test(&self, mode: DigitalTestMode) -> XpadResult<()> {
        self.run_job(Job::DigitalTest { mode }).await
    }

    /// Ask the server to abort, then stop the running job locally.
    ///
    /// The worker stops reading frames at once; what the server already sent is read
    /// before the next job.
    pub async fn abort(&self) -> XpadResult<()> {
        self.poller.abort_current_process().await?;
        self.engine.cancel();
        Ok(())
    }

    /// Submit `job` once the engine is idle, first making sure an interrupted
    /// exposure will end on the server.
    async fn run_job(&self, job: Job) -> XpadResult<()> {
        self.engine.wait_idle().await;
        if self.engine.interrupted_transfer().is_some() {
            self.poller.abort_current_process().await?;
        }
        self.engine.submit_when_idle(job).await
    }

    // =========================================================================
    // Engine state
    // =========================================================================

    /// Query the server state over the secondary connection.
    pub async fn status(&self) -> XpadResult<DetectorStatus> {
        let mut status = self.poller.status().await?;
        if status.completed_frames.is_none() && self.engine.is_running() {
            status.completed_frames = Some(self.engine.acquired_frames());
        }
        Ok(status)
    }

    /// True while a job is running.
    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// What the engine worker is doing.
    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    /// Wait for the running job, if any.
    pub async fn wait_idle(&self) {
        self.engine.wait_idle().await
    }

    /// Frames delivered by the current or last exposure.
    pub fn acquired_frames(&self) -> u64 {
        self.engine.acquired_frames()
    }

    /// Report of the last finished job.
    pub fn last_report(&self) -> Option<JobReport> {
        self.engine.last_report()
    }

    // =========================================================================
    // Side-channel commands
    // =========================================================================

    /// Send `ResetDetector` without waiting for the reset to finish.
    pub async fn reset(&self) -> XpadResult<()> {
        tracing::info!("Resetting detector");
        self.poller.send_no_wait("ResetDetector").await
    }

    /// Check that the detector reports ready.
    pub async fn ask_ready(&self) -> XpadResult<()> {
        self.poller.command_checked("AskReady").await
    }

    /// Current burst number; also used for the next file-transfer exposure.
    pub async fn burst_number(&self) -> XpadResult<u64> {
        let burst = self.poller.command_int("GetBurstNumber").await?;
        let burst = u64::try_from(burst).unwrap_or(0);
        self.engine.set_burst_number(burst);
        Ok(burst)
    }

    /// Increment and return the burst number.
    pub async fn increase_burst_number(&self) -> XpadResult<u64> {
        self.burst_command("IncreaseBurstNumber").await
    }

    /// Decrement and return the burst number.
    pub async fn decrease_burst_number(&self) -> XpadResult<u64> {
        self.burst_command("DecreaseBurstNumber").await
    }

    /// Reset the burst number to 0.
    pub async fn reset_burst_number(&self) -> XpadResult<()> {
        self.poller.command_checked("ResetBurstNumber").await?;
        self.engine.set_burst_number(0);
        Ok(())
    }

    /// Toggle server debug output.
    pub async fn set_debug_mode(&self, enabled: bool) -> XpadResult<()> {
        self.poller
            .command_checked(&format!("SetDebugMode {enabled}"))
            .await
    }

    /// Toggle server-side timing output.
    pub async fn show_timers(&self, enabled: bool) -> XpadResult<()> {
        self.poller
            .command_checked(&format!("ShowTimers {enabled}"))
            .await
    }

    /// Record a flat-field reference image under `name`.
    pub async fn create_white_image(&self, name: &str) -> XpadResult<()> {
        self.poller
            .command_checked(&format!("CreateWhiteImage {name}"))
            .await
    }

    /// Delete the white image `name`.
    pub async fn delete_white_image(&self, name: &str) -> XpadResult<()> {
        self.poller
            .command_checked(&format!("DeleteWhiteImage {name}"))
            .await
    }

    /// Use `name` for flat-field correction.
    pub async fn set_white_image(&self, name: &str) -> XpadResult<()> {
        self.poller
            .command_checked(&format!("SetWhiteImage {name}"))
            .await
    }

    /// White images stored in the server's calibration directory.
    pub async fn white_images(&self) -> XpadResult<Vec<String>> {
        let listing = self.poller.command_string("GetWhiteImagesInDir").await?;
        Ok(listing.split_whitespace().map(str::to_string).collect())
    }

    /// Ask the server to build its dead/noisy pixel mask.
    pub async fn create_dead_noisy_mask(&self) -> XpadResult<()> {
        self.poller.command_checked("CreateDeadNoisyMask").await
    }

    /// Read a global register; one row of chip values per module.
    pub async fn read_global_register(&self, name: &str) -> XpadResult<Vec<Vec<u16>>> {
        let register = lookup_register(name)?;
        let command = format!("ReadConfigG {}", register.name);
        let reply = self.poller.command_string(&command).await?;
        if reply.len() <= 1 {
            return Err(XpadError::DetectorFailure(format!(
                "'{command}' returned no values"
            )));
        }
        parse_register_reply(&reply, module_count(self.info.module_mask))
    }

    /// Write `value` to a global register on every chip.
    pub async fn load_global_register(&self, name: &str, value: u16) -> XpadResult<()> {
        let register = lookup_register(name)?;
        let command = format!("LoadConfigG {} {value}", register.name);
        let reply = self.poller.command_string(&command).await?;
        if reply.len() <= 1 {
            return Err(XpadError::DetectorFailure(format!("'{command}' was not applied")));
        }
        Ok(())
    }

    /// Stop the running job, send `Exit` on both connections and close them.
    pub async fn shutdown(self) -> XpadResult<()> {
        if self.engine.is_running() {
            tracing::info!("Stopping running job before shutdown");
            if let Err(e) = self.poller.abort_current_process().await {
                tracing::warn!(error = %e, "Abort before shutdown failed");
            }
            self.engine.cancel();
            self.engine.wait_idle().await;
        } else if self.engine.interrupted_transfer().is_some() {
            if let Err(e) = self.poller.abort_current_process().await {
                tracing::warn!(error = %e, "Abort before shutdown failed");
            }
        }

        let interrupted = self.engine.interrupted_transfer();
        let mut primary = self.engine.shutdown().await?;
        if let Some(transfer) = interrupted {
            let depth = self.config.acquisition.pixel_depth;
            if let Err(e) = primary.recover_exposure(transfer, depth).await {
                tracing::debug!(error = %e, "Interrupted exposure not recovered");
            }
        }
        if let Err(e) = primary.send("Exit").await {
            tracing::debug!(error = %e, "Exit on primary connection failed");
        }
        primary.disconnect().await;

        if let Err(e) = self.poller.send_no_wait("Exit").await {
            tracing::debug!(error = %e, "Exit on secondary connection failed");
        }
        self.poller.disconnect().await;
        Ok(())
    }

    async fn burst_command(&self, command: &str) -> XpadResult<u64> {
        let burst = self.poller.command_int(command).await?;
        let burst = u64::try_from(burst).map_err(|_| XpadError::DetectorRejected {
            command: command.to_string(),
            code: burst,
        })?;
        self.engine.set_burst_number(burst);
        Ok(burst)
    }
}

fn lookup_register(name: &str) -> XpadResult<&'static crate::engine::Register> {
    register_by_name(name)
        .ok_or_else(|| XpadError::InvalidParameter(format!("unknown global register '{name}'")))
}

/// `Init`: 0 ready, 1 busy, -1 failed.
async fn init<S>(client: &mut ProtocolClient<S>) -> XpadResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match client.send_and_await_integer("Init").await {
        Ok(0) => Ok(()),
        Ok(1) => Err(XpadError::DetectorBusy {
            command: "Init".to_string(),
        }),
        Ok(code) => Err(XpadError::DetectorRejected {
            command: "Init".to_string(),
            code,
        }),
        Err(ProtocolError::Failed { message, .. }) => Err(XpadError::DetectorFailure(
            format!("initialization failed: {message}"),
        )),
        Err(e) => Err(e.into()),
    }
}

async fn read_info<S>(client: &mut ProtocolClient<S>) -> XpadResult<DetectorInfo>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let detector_type = client.send_and_await_string("GetDetectorType").await?;
    let model = client.send_and_await_string("GetDetectorModel").await?;
    let module_mask = query_u32(client, "GetModuleMask").await?;
    let chip_mask = query_u32(client, "GetChipMask").await?;
    let module_count = query_u32(client, "GetModuleNumber").await?;
    let chip_count = query_u32(client, "GetChipNumber").await?;
    let burst_number = client.send_and_await_integer("GetBurstNumber").await?;
    let image_size = client.send_and_await_string("GetImageSize").await?;
    let (image_rows, image_columns) = parse_image_size(&image_size)?;

    Ok(DetectorInfo {
        detector_type,
        model,
        module_mask,
        chip_mask,
        module_count,
        chip_count,
        burst_number: u64::try_from(burst_number).unwrap_or(0),
        image_rows,
        image_columns,
    })
}

async fn query_u32<S>(client: &mut ProtocolClient<S>, command: &str) -> XpadResult<u32>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let value = client.send_and_await_integer(command).await?;
    u32::try_from(value)
        .map_err(|_| XpadError::DetectorFailure(format!("'{command}' returned {value}")))
}

/// Parse `"<rows>x<columns>"`.
pub fn parse_image_size(reply: &str) -> XpadResult<(u32, u32)> {
    let bad = || XpadError::DetectorFailure(format!("malformed image size {reply:?}"));
    let (rows, columns) = reply.trim().split_once('x').ok_or_else(bad)?;
    let rows = rows.trim().parse().map_err(|_| bad())?;
    let columns = columns.trim().parse().map_err(|_| bad())?;
    Ok((rows, columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CollectingSink;
    use crate::status::DetectorState;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Answers each command line with the scripted reply.
    async fn scripted_server(stream: DuplexStream, script: Vec<(&'static str, &'static str)>) {
        let mut reader = BufReader::new(stream);
        reader.get_mut().write_all(b"> ").await.unwrap();
        for (expected, reply) in script {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim_end(), expected);
            reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
        }
    }

    fn primary_script() -> Vec<(&'static str, &'static str)> {
        vec![
            ("Init", "*0\n"),
            ("SetModuleMask 3", "*0\n"),
            ("GetDetectorType", "*\"XPAD_S70\"\n"),
            ("GetDetectorModel", "*\"S70\"\n"),
            ("GetModuleMask", "*3\n"),
            ("GetChipMask", "*127\n"),
            ("GetModuleNumber", "*2\n"),
            ("GetChipNumber", "*7\n"),
            ("GetBurstNumber", "*4\n"),
            ("GetImageSize", "*\"240x560\"\n"),
        ]
    }

    fn config() -> XpadConfig {
        let mut config = XpadConfig::default();
        config.detector.module_mask = 3;
        config
    }

    #[test]
    fn image_size_parsing() {
        assert_eq!(parse_image_size("120x560").unwrap(), (120, 560));
        assert_eq!(parse_image_size(" 240 x 80 ").unwrap(), (240, 80));
        assert!(parse_image_size("120").is_err());
        assert!(parse_image_size("ax80").is_err());
    }

    #[test]
    fn settings_take_transfer_from_config() {
        let mut acquisition = AcquisitionConfig::default();
        acquisition.image_transfer = TransferMode::File;

        let params = ExposureSettings::default().into_params(&acquisition).unwrap();
        assert_eq!(params.transfer_mode, TransferMode::File);
        assert_eq!(params.latency_time, Duration::from_micros(5000));

        let settings = ExposureSettings {
            transfer_mode: Some(TransferMode::Direct),
            output_signal_mode: 9,
            ..Default::default()
        };
        assert!(settings.into_params(&acquisition).is_err());
    }

    #[tokio::test]
    async fn connect_reads_detector_info() {
        let (primary_end, primary_server) = tokio::io::duplex(1024);
        let (secondary_end, secondary_server) = tokio::io::duplex(1024);

        let primary_task = tokio::spawn(scripted_server(primary_server, primary_script()));
        let secondary_task = tokio::spawn(scripted_server(
            secondary_server,
            vec![("Init", "*0\n"), ("GetDetectorStatus", "*\"Idle\"\n")],
        ));

        let detector = XpadDetector::from_clients(
            config(),
            ProtocolClient::from_stream(primary_end),
            ProtocolClient::from_stream(secondary_end),
            Arc::new(CollectingSink::new()),
        )
        .await
        .unwrap();

        let info = detector.info();
        assert_eq!(info.detector_type, "XPAD_S70");
        assert_eq!(info.module_mask, 3);
        assert_eq!(info.burst_number, 4);
        assert_eq!((info.image_rows, info.image_columns), (240, 560));

        assert_eq!(detector.status().await.unwrap().state, DetectorState::Idle);
        assert!(!detector.is_running());

        primary_task.await.unwrap();
        secondary_task.await.unwrap();
    }

    #[tokio::test]
    async fn busy_init_is_reported() {
        let (primary_end, primary_server) = tokio::io::duplex(256);
        let (secondary_end, mut secondary_server) = tokio::io::duplex(256);
        tokio::spawn(scripted_server(primary_server, vec![("Init", "*1\n")]));
        secondary_server.write_all(b"> ").await.unwrap();

        let result = XpadDetector::from_clients(
            XpadConfig::default(),
            ProtocolClient::from_stream(primary_end),
            ProtocolClient::from_stream(secondary_end),
            Arc::new(CollectingSink::new()),
        )
        .await;

        match result {
            Err(XpadError::DetectorBusy { command }) => assert_eq!(command, "Init"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("busy detector accepted"),
        }
    }
}

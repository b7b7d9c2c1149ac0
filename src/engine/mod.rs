//! Acquisition engine.
//!
//! One worker task owns the primary [`DetectorLink`] and runs jobs to completion, one
//! at a time. Callers interact through [`Engine`]:
//!
//! - [`Engine::submit`] hands a job to the worker, or fails with
//!   [`XpadError::EngineBusy`] while another job is running.
//! - [`Engine::cancel`] requests that the running job stop. The worker checks the
//!   request before dispatching a job and on every exposure-loop iteration, and stops
//!   reading frames as soon as it sees it.
//! - [`Engine::interrupted_transfer`] reports an exposure that was left unfinished on
//!   the wire. The worker reads the leftover frames and completion code before its
//!   next job, so the server must be told to abort first.
//! - [`Engine::wait_idle`] parks the caller until the worker returns to idle.
//!
//! State, the cancellation flag and the acquired-frame counter live in a single
//! monitor (a `parking_lot::Mutex` paired with a `tokio::sync::Notify`). The flag is
//! cleared only by the worker, in the same critical section that returns the state
//! to idle.

pub mod job;
pub mod link;
pub mod sink;

pub use job::{
    calibration_paths, register_by_name, CalibrationConfig, CorrectionFlags, DigitalTestMode,
    ExposureParams, ExposureParamsBuilder, Job, JobOutcome, Register, TransferMode,
    TriggerMode, GLOBAL_REGISTERS,
};
pub use link::DetectorLink;
pub use sink::{BroadcastSink, CollectingSink, FrameSink};

use crate::error::{FrameError, XpadError, XpadResult};
use crate::frame::{self, PixelDepth};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Command that starts an exposure; its completion code arrives after the last frame.
pub const START_EXPOSURE: &str = "StartExposure";

/// Disables geometrical correction before a digital test.
const DISABLE_GEOMETRICAL_CORRECTION: &str = "SetGeometricalCorrectionFlag false";

// =============================================================================
// Public state types
// =============================================================================

/// What the worker is doing.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EngineState {
    /// Waiting for a job.
    #[default]
    Idle,
    /// Accepted or executing this job.
    Running(Job),
}

impl EngineState {
    /// True when a new job would be accepted.
    pub fn is_idle(&self) -> bool {
        matches!(self, EngineState::Idle)
    }
}

/// Result of the most recently finished job.
#[derive(Debug, Clone)]
pub struct JobReport {
    /// [`Job::name`] of the finished job.
    pub job: &'static str,
    /// Frames published to the sink by this job.
    pub acquired_frames: u64,
    /// Outcome, or the error that ended the job.
    pub result: Result<JobOutcome, Arc<XpadError>>,
}

impl JobReport {
    /// True only for [`JobOutcome::Completed`].
    pub fn is_success(&self) -> bool {
        matches!(self.result, Ok(JobOutcome::Completed))
    }
}

/// Fixed parameters of the worker.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Width of the pixels handed to the sink.
    pub pixel_depth: PixelDepth,
    /// Image size used to decode frame files.
    pub image_rows: u32,
    /// Image width used to decode frame files.
    pub image_columns: u32,
    /// Module mask used to lay out saved global configurations.
    pub module_mask: u32,
    /// Burst whose frame files the first file-transfer exposure reads.
    pub burst_number: u64,
    /// Delay between checks for the next frame file.
    pub file_poll_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pixel_depth: PixelDepth::Bits32,
            image_rows: 120,
            image_columns: 80,
            module_mask: 1,
            burst_number: 0,
            file_poll_interval: Duration::from_millis(10),
        }
    }
}

// =============================================================================
// Monitor
// =============================================================================

#[derive(Debug, Default)]
struct Monitor {
    state: EngineState,
    cancel_requested: bool,
    acquired_frames: u64,
    burst_number: u64,
    last_report: Option<JobReport>,
    /// Exposure stopped before its frames and completion code were read.
    interrupted: Option<TransferMode>,
}

#[derive(Debug, Default)]
struct Shared {
    monitor: Mutex<Monitor>,
    idle: Notify,
}

impl Shared {
    fn cancel_requested(&self) -> bool {
        self.monitor.lock().cancel_requested
    }

    fn record_frame(&self) {
        self.monitor.lock().acquired_frames += 1;
    }

    fn acquired_frames(&self) -> u64 {
        self.monitor.lock().acquired_frames
    }

    fn interrupted(&self) -> Option<TransferMode> {
        self.monitor.lock().interrupted
    }

    fn set_interrupted(&self, transfer: Option<TransferMode>) {
        self.monitor.lock().interrupted = transfer;
    }

    fn finish(&self, job: &Job, result: XpadResult<JobOutcome>) {
        let mut monitor = self.monitor.lock();
        let report = JobReport {
            job: job.name(),
            acquired_frames: monitor.acquired_frames,
            result: result.map_err(Arc::new),
        };

        match &report.result {
            Ok(JobOutcome::Completed) => {
                tracing::info!(
                    job = report.job,
                    frames = report.acquired_frames,
                    "Job completed"
                );
            }
            Ok(outcome) => {
                tracing::warn!(
                    job = report.job,
                    frames = report.acquired_frames,
                    ?outcome,
                    "Job stopped early"
                );
            }
            Err(e) => {
                tracing::error!(
                    job = report.job,
                    frames = report.acquired_frames,
                    error = %e,
                    "Job failed"
                );
            }
        }

        monitor.state = EngineState::Idle;
        monitor.cancel_requested = false;
        monitor.last_report = Some(report);
        drop(monitor);
        self.idle.notify_waiters();
    }
}

// =============================================================================
// Engine handle
// =============================================================================

/// Handle to the acquisition worker.
pub struct Engine<L> {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<L>,
}

impl<L> Engine<L>
where
    L: DetectorLink + 'static,
{
    /// Start the worker task on the current runtime.
    pub fn spawn(link: L, sink: Arc<dyn FrameSink>, settings: EngineSettings) -> Self {
        let shared = Arc::new(Shared::default());
        shared.monitor.lock().burst_number = settings.burst_number;

        let (jobs, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            link,
            sink,
            settings,
            shared: Arc::clone(&shared),
        };
        let worker = tokio::spawn(worker.run(rx));

        Self {
            shared,
            jobs,
            worker,
        }
    }

    /// Hand `job` to the worker.
    ///
    /// Fails with [`XpadError::EngineBusy`] if a job is already running; the running
    /// job is not affected.
    pub fn submit(&self, job: Job) -> XpadResult<()> {
        let mut monitor = self.shared.monitor.lock();
        if !monitor.state.is_idle() {
            return Err(XpadError::EngineBusy);
        }

        tracing::debug!(job = job.name(), "Submitting job");
        monitor.state = EngineState::Running(job.clone());
        monitor.acquired_frames = 0;

        if self.jobs.send(job).is_err() {
            monitor.state = EngineState::Idle;
            return Err(XpadError::EngineStopped);
        }
        Ok(())
    }

    /// Wait for idle, then submit. Retries if another caller got in first.
    pub async fn submit_when_idle(&self, job: Job) -> XpadResult<()> {
        loop {
            self.wait_idle().await;
            match self.submit(job.clone()) {
                Err(XpadError::EngineBusy) => continue,
                other => return other,
            }
        }
    }

    /// Wait until no job is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.monitor.lock().state.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Request that the running job stop. Returns `false` if the engine was idle.
    pub fn cancel(&self) -> bool {
        let mut monitor = self.shared.monitor.lock();
        if monitor.state.is_idle() {
            return false;
        }
        tracing::info!("Cancellation requested");
        monitor.cancel_requested = true;
        true
    }

    /// True from `submit` until the job's report is recorded.
    pub fn is_running(&self) -> bool {
        !self.shared.monitor.lock().state.is_idle()
    }

    /// Transfer mode of an exposure that was stopped locally and whose remaining
    /// frames and completion code are still unread.
    ///
    /// The server keeps producing until it receives `AbortCurrentProcess`; send it
    /// before submitting the next job, which first reads the leftovers.
    pub fn interrupted_transfer(&self) -> Option<TransferMode> {
        self.shared.interrupted()
    }

    /// Snapshot of the worker state.
    pub fn state(&self) -> EngineState {
        self.shared.monitor.lock().state.clone()
    }

    /// Frames published by the current or most recent exposure.
    pub fn acquired_frames(&self) -> u64 {
        self.shared.acquired_frames()
    }

    /// Report of the last finished job.
    pub fn last_report(&self) -> Option<JobReport> {
        self.shared.monitor.lock().last_report.clone()
    }

    /// Burst read by the next file-transfer exposure.
    pub fn burst_number(&self) -> u64 {
        self.shared.monitor.lock().burst_number
    }

    /// Burst whose frame files the next file-transfer exposure reads.
    pub fn set_burst_number(&self, burst: u64) {
        self.shared.monitor.lock().burst_number = burst;
    }

    /// Stop accepting jobs and return the link once the current job has finished.
    ///
    /// An interrupted exposure is left unread; see [`DetectorLink::recover_exposure`].
    pub async fn shutdown(self) -> XpadResult<L> {
        drop(self.jobs);
        self.worker.await.map_err(|_| XpadError::EngineStopped)
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Why an exposure loop stopped before the server ran out of frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// Server signalled no more frames.
    Exhausted,
    /// Requested frame count reached.
    Target,
    Cancelled,
    SinkRefused,
}

struct Worker<L> {
    link: L,
    sink: Arc<dyn FrameSink>,
    settings: EngineSettings,
    shared: Arc<Shared>,
}

impl<L> Worker<L>
where
    L: DetectorLink,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Job>) -> L {
        tracing::debug!("Engine worker started");
        while let Some(job) = rx.recv().await {
            let result = if self.shared.cancel_requested() {
                Ok(JobOutcome::Cancelled)
            } else {
                match self.recover().await {
                    Ok(()) => self.dispatch(&job).await,
                    Err(e) => Err(e),
                }
            };
            self.shared.finish(&job, result);
        }
        tracing::debug!("Engine worker stopped");
        self.link
    }

    /// Read what an interrupted exposure left on the link.
    async fn recover(&mut self) -> XpadResult<()> {
        let Some(transfer) = self.shared.interrupted() else {
            return Ok(());
        };
        self.shared.set_interrupted(None);
        let code = self
            .link
            .recover_exposure(transfer, self.settings.pixel_depth)
            .await?;
        tracing::debug!(code, ?transfer, "Recovered link after interrupted exposure");
        Ok(())
    }

    async fn dispatch(&mut self, job: &Job) -> XpadResult<JobOutcome> {
        if let Some(command) = job.single_command() {
            let code = self.link.command_int(&command).await?;
            return JobOutcome::from_code(&command, code);
        }

        match job {
            Job::Exposure(params) => self.run_exposure(params).await,
            Job::LoadCalibration { path } => self.load_calibration(path).await,
            Job::SaveCalibration { path } => self.save_calibration(path).await,
            Job::LoadDefaultGlobalConfig => self.load_default_global_config().await,
            Job::DigitalTest { mode } => self.digital_test(*mode).await,
            other => Err(XpadError::InvalidParameter(format!(
                "no handler for job {other}"
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Exposure
    // -------------------------------------------------------------------------

    async fn run_exposure(&mut self, params: &ExposureParams) -> XpadResult<JobOutcome> {
        let code = self.link.command_int(&params.command_line()).await?;
        XpadError::check_status("SetExposureParameters", code)?;

        let burst = self.shared.monitor.lock().burst_number;
        if params.transfer_mode == TransferMode::File {
            remove_burst_files(&params.output_path, burst).await;
        }

        tracing::info!(
            frames = params.frame_count,
            transfer = ?params.transfer_mode,
            "Starting exposure"
        );
        self.link.send_line(START_EXPOSURE).await?;

        let end = match params.transfer_mode {
            TransferMode::Direct => self.stream_direct(params.frame_count).await?,
            TransferMode::File => self.stream_files(params, burst).await?,
        };

        if matches!(end, StreamEnd::Cancelled | StreamEnd::SinkRefused) {
            // Frames and the completion code stay on the wire until the next job.
            tracing::debug!(?end, "Exposure interrupted");
            self.shared.set_interrupted(Some(params.transfer_mode));
            return Ok(JobOutcome::Cancelled);
        }

        let code = self.link.await_completion(START_EXPOSURE).await?;
        tracing::debug!(code, ?end, "Exposure finished");

        if self.shared.cancel_requested() {
            return Ok(JobOutcome::Cancelled);
        }
        JobOutcome::from_code(START_EXPOSURE, code)
    }

    fn target_reached(&self, frame_count: u32) -> bool {
        frame_count != 0 && self.shared.acquired_frames() >= u64::from(frame_count)
    }

    async fn stream_direct(&mut self, frame_count: u32) -> XpadResult<StreamEnd> {
        let depth = self.settings.pixel_depth;
        loop {
            if self.target_reached(frame_count) {
                return Ok(StreamEnd::Target);
            }
            if self.shared.cancel_requested() {
                return Ok(StreamEnd::Cancelled);
            }

            let sequence_number = self.shared.acquired_frames();
            let frame = match self.link.pull_frame(depth, sequence_number).await {
                Ok(frame) => frame,
                Err(FrameError::NoFrame) => return Ok(StreamEnd::Exhausted),
                Err(e) => return Err(e.into()),
            };

            let accepted = self.sink.publish(frame);
            self.shared.record_frame();
            if !accepted {
                return Ok(StreamEnd::SinkRefused);
            }
        }
    }

    async fn stream_files(&mut self, params: &ExposureParams, burst: u64) -> XpadResult<StreamEnd> {
        let depth = self.settings.pixel_depth;
        let (rows, columns) = (self.settings.image_rows, self.settings.image_columns);
        let mut ticker = tokio::time::interval(self.settings.file_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.target_reached(params.frame_count) {
                return Ok(StreamEnd::Target);
            }

            let sequence_number = self.shared.acquired_frames();
            let path = frame::frame_file_path(&params.output_path, burst, sequence_number);
            let frame = loop {
                if self.shared.cancel_requested() {
                    return Ok(StreamEnd::Cancelled);
                }
                if tokio::fs::metadata(&path).await.is_ok() {
                    if let Some(frame) =
                        frame::read_frame_file(&path, rows, columns, depth, sequence_number).await?
                    {
                        break frame;
                    }
                }
                ticker.tick().await;
            };

            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove frame file");
            }

            let accepted = self.sink.publish(frame);
            self.shared.record_frame();
            if !accepted {
                return Ok(StreamEnd::SinkRefused);
            }
        }
    }

    /// `DigitalTest`: one synthetic image on the command connection, then the
    /// completion code. Any non-zero code is a failure.
    async fn digital_test(&mut self, mode: DigitalTestMode) -> XpadResult<JobOutcome> {
        let code = self.link.command_int(DISABLE_GEOMETRICAL_CORRECTION).await?;
        XpadError::check_status(DISABLE_GEOMETRICAL_CORRECTION, code)?;

        let command = format!("DigitalTest {}", mode.wire_name());
        tracing::info!(mode = mode.wire_name(), "Starting digital test");
        self.link.send_line(&command).await?;

        match self.link.pull_frame(self.settings.pixel_depth, 0).await {
            Ok(frame) => {
                self.sink.publish(frame);
                self.shared.record_frame();
            }
            Err(FrameError::NoFrame) => tracing::warn!(%command, "No test image received"),
            Err(e) => return Err(e.into()),
        }

        let code = self.link.await_completion(&command).await?;
        if code != 0 {
            return Err(XpadError::DetectorRejected { command, code });
        }
        Ok(JobOutcome::Completed)
    }

    // -------------------------------------------------------------------------
    // Calibration files
    // -------------------------------------------------------------------------

    async fn load_calibration(&mut self, path: &Path) -> XpadResult<JobOutcome> {
        let (global, local) = calibration_paths(path);

        let code = self.link.upload_config("LoadConfigGFromFile", &global).await?;
        let outcome = JobOutcome::from_code("LoadConfigGFromFile", code)?;
        if outcome != JobOutcome::Completed {
            return Ok(outcome);
        }
        tracing::info!(path = %global.display(), "Global configuration loaded");

        let code = self.link.upload_config("LoadConfigLFromFile", &local).await?;
        JobOutcome::from_code("LoadConfigLFromFile", code)
    }

    async fn save_calibration(&mut self, path: &Path) -> XpadResult<JobOutcome> {
        let (global, local) = calibration_paths(path);

        self.save_global_config(&global).await?;
        tracing::info!(path = %global.display(), "Global configuration saved");

        let code = self.link.download_config("ReadConfigL", &local).await?;
        JobOutcome::from_code("ReadConfigL", code)
    }

    async fn save_global_config(&mut self, path: &Path) -> XpadResult<()> {
        let modules = module_count(self.settings.module_mask);
        if modules == 0 {
            return Err(XpadError::InvalidParameter(
                "module mask is 0, nothing to save".to_string(),
            ));
        }

        let mut contents = String::new();
        for register in GLOBAL_REGISTERS.iter() {
            let command = format!("ReadConfigG {}", register.name);
            let reply = self.link.command_string(&command).await?;
            if reply.len() <= 1 {
                return Err(XpadError::DetectorFailure(format!(
                    "'{command}' returned no values"
                )));
            }

            let per_module = parse_register_reply(&reply, modules)?;
            for (index, values) in per_module.iter().enumerate() {
                let _ = write!(contents, "{} {}", 1u32 << index, register.id);
                for value in values {
                    let _ = write!(contents, " {value}");
                }
                contents.push('\n');
            }
        }

        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn load_default_global_config(&mut self) -> XpadResult<JobOutcome> {
        let mut failed = Vec::new();
        for register in GLOBAL_REGISTERS.iter() {
            let command = format!("LoadConfigG {} {}", register.name, register.default_value);
            let reply = self.link.command_string(&command).await?;
            if reply.len() <= 1 {
                failed.push(register.name);
            }
        }

        if failed.is_empty() {
            Ok(JobOutcome::Completed)
        } else {
            Err(XpadError::DetectorFailure(format!(
                "default values not loaded for {}",
                failed.join(", ")
            )))
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Chip values per module in a global register reply.
pub const CHIPS_PER_MODULE: usize = 7;

/// Number of modules covered by `mask`, counting up to its highest set bit.
pub fn module_count(mask: u32) -> usize {
    (u32::BITS - mask.leading_zeros()) as usize
}

/// Split a `ReadConfigG` reply into per-module chip values.
///
/// Each module contributes a leading token followed by one value per chip; modules
/// are separated by one extra token.
pub fn parse_register_reply(reply: &str, modules: usize) -> XpadResult<Vec<Vec<u16>>> {
    let mut tokens = reply
        .split(|c: char| c.is_whitespace() || c == ',' || c == '.')
        .filter(|t| !t.is_empty());

    let mut out = Vec::with_capacity(modules);
    for module in 0..modules {
        if module > 0 {
            tokens.next();
        }
        tokens.next();

        let mut values = Vec::with_capacity(CHIPS_PER_MODULE);
        for _ in 0..CHIPS_PER_MODULE {
            let token = tokens.next().ok_or_else(|| {
                XpadError::DetectorFailure(format!("register reply too short: {reply:?}"))
            })?;
            let value = token.parse::<u16>().map_err(|_| {
                XpadError::DetectorFailure(format!("bad register value {token:?}"))
            })?;
            values.push(value);
        }
        out.push(values);
    }
    Ok(out)
}

/// Remove frame files left over from an earlier run of `burst`.
async fn remove_burst_files(dir: &Path, burst: u64) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Cannot list output directory");
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if frame::is_burst_file(name, burst) {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                tracing::warn!(file = name, error = %e, "Failed to remove stale frame file");
            }
        }
    }
}

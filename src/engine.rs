// src/engine.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::config::{BenchConfig, DeviceRequest};
use crate::drivers::analyzer::Analyzer;
use crate::drivers::device::{DeviceSource, DriverFactory};
use crate::drivers::error::{AnalysisError, ConfigError, ReadError, RunError};
use crate::drivers::feed::FeedSource;
use crate::drivers::pileup::PileupDetector;
use crate::drivers::replay::ReplaySource;
use crate::drivers::selector::{select_channels, Selection};
use crate::drivers::source::SourceAdapter;
use crate::types::{
    AnalysisConfig, AnalysisUpdate, AnalyzedFrame, ChannelSelection, RunEnd, RunState,
    RunSummary, SourceConfig,
};

/// Receives the output of a run. `deliver` is called once per analyzed frame
/// and must return promptly.
pub trait FrameConsumer {
    fn deliver(&mut self, frame: AnalyzedFrame);

    fn analysis_failed(&mut self, _err: &AnalysisError) {}

    fn run_ended(&mut self, _summary: &RunSummary) {}
}

impl<F: FnMut(AnalyzedFrame)> FrameConsumer for F {
    fn deliver(&mut self, frame: AnalyzedFrame) {
        self(frame)
    }
}

struct Control {
    state: RunState,
    analysis: AnalysisConfig,
    selection: ChannelSelection,
    // bumped on every reset request; lets the loop tell whether a newer
    // request arrived after the snapshot that honored one
    reset_revision: u64,
}

impl Control {
    fn request_reset(&mut self) {
        self.analysis.reset_accumulator = true;
        self.reset_revision += 1;
    }
}

struct Shared {
    control: Mutex<Control>,
    stop: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable remote for a `RunController`, usable from any thread.
#[derive(Clone)]
pub struct ControlHandle {
    shared: Arc<Shared>,
}

impl ControlHandle {
    /// Asks the loop to exit at its next iteration boundary. Never blocks.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let mut control = self.shared.lock();
        if control.state == RunState::Running {
            control.state = RunState::StopRequested;
        }
    }

    /// Applies a partial update atomically. Returns whether the change
    /// forces an accumulator reset.
    pub fn update_analysis_config(&self, update: &AnalysisUpdate) -> Result<bool, ConfigError> {
        let mut control = self.shared.lock();
        let semantic = control.analysis.apply(update)?;
        if semantic || update.reset_accumulator {
            control.request_reset();
        }
        Ok(semantic)
    }

    pub fn select_channels(&self, selection: ChannelSelection) {
        let mut control = self.shared.lock();
        if control.selection != selection {
            debug!("channel selection -> {:?}", selection.ids());
            control.selection = selection;
            control.request_reset();
        }
    }

    pub fn analysis_config(&self) -> AnalysisConfig {
        self.shared.lock().analysis.clone()
    }

    pub fn selection(&self) -> ChannelSelection {
        self.shared.lock().selection.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn state(&self) -> RunState {
        self.shared.lock().state
    }
}

/// Outcome of a single loop iteration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Finished(RunSummary),
}

#[derive(Default)]
struct Counters {
    frames_read: u64,
    frames_delivered: u64,
    frames_skipped: u64,
    analysis_errors: u64,
}

/// Drives the acquisition loop: configure, run, cooperative stop, cleanup.
pub struct RunController {
    shared: Arc<Shared>,
    bench: BenchConfig,
    drivers: Box<dyn DriverFactory>,
    source: Option<Box<dyn SourceAdapter>>,
    analyzer: Analyzer,
    counters: Counters,
}

impl RunController {
    pub fn new(bench: BenchConfig, drivers: Box<dyn DriverFactory>) -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: RunState::Idle,
                    analysis: AnalysisConfig::default(),
                    selection: ChannelSelection::default(),
                    reset_revision: 0,
                }),
                stop: AtomicBool::new(false),
            }),
            bench,
            drivers,
            source: None,
            analyzer: Analyzer::new(),
            counters: Counters::default(),
        }
    }

    pub fn with_pileup_detector(mut self, detector: Box<dyn PileupDetector>) -> Self {
        self.analyzer.set_pileup_detector(detector);
        self
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Opens the source described by `config`. Rejected while a run is active;
    /// on failure nothing is started and the controller returns to `Idle`.
    pub fn configure(
        &mut self,
        config: SourceConfig,
        selection: ChannelSelection,
    ) -> Result<(), ConfigError> {
        self.enter_configuring()?;
        match self.open_source(&config) {
            Ok(source) => {
                self.install(source, selection);
                Ok(())
            }
            Err(err) => {
                warn!("configure {} failed: {err}", config.kind());
                self.shared.lock().state = RunState::Idle;
                Err(err)
            }
        }
    }

    /// Like `configure`, with an already opened source.
    pub fn configure_with(
        &mut self,
        source: Box<dyn SourceAdapter>,
        selection: ChannelSelection,
    ) -> Result<(), ConfigError> {
        self.enter_configuring()?;
        self.install(source, selection);
        Ok(())
    }

    fn enter_configuring(&mut self) -> Result<(), ConfigError> {
        let mut control = self.shared.lock();
        if control.state.is_running() {
            return Err(ConfigError::AlreadyRunning(control.state));
        }
        control.state = RunState::Configuring;
        drop(control);
        // A configured but never run source is replaced.
        self.close_source();
        Ok(())
    }

    fn install(&mut self, source: Box<dyn SourceAdapter>, selection: ChannelSelection) {
        info!("configured {} with channels {:?}", source.describe(), selection.ids());
        self.source = Some(source);
        self.analyzer.reset();
        self.shared.stop.store(false, Ordering::SeqCst);
        let mut control = self.shared.lock();
        control.selection = selection;
        control.request_reset();
    }

    /// Opens the backend described by `config` without installing it.
    pub fn open_source(&self, config: &SourceConfig) -> Result<Box<dyn SourceAdapter>, ConfigError> {
        let source: Box<dyn SourceAdapter> = match config {
            SourceConfig::Device {
                adc_name,
                channels,
                sample_rate_hz,
                trace_length_ms,
                voltage_min,
                voltage_max,
                trigger,
            } => {
                let settings = self.bench.resolve_device(&DeviceRequest {
                    adc_name: adc_name.clone(),
                    channels: channels.clone(),
                    sample_rate_hz: *sample_rate_hz,
                    trace_length_ms: *trace_length_ms,
                    voltage_min: *voltage_min,
                    voltage_max: *voltage_max,
                    trigger: *trigger,
                })?;
                let driver = self.drivers.create(&settings.adc_name)?;
                Box::new(DeviceSource::open(settings, driver)?)
            }
            SourceConfig::Replay { files, looping } => {
                if files.is_empty() {
                    return Err(ConfigError::MissingParameter("files"));
                }
                Box::new(ReplaySource::open(files.clone(), *looping)?)
            }
            SourceConfig::Feed(handle) => Box::new(FeedSource::open(handle.clone())?),
        };
        Ok(source)
    }

    /// Enters `Running`. Call `step` afterwards until it reports `Finished`.
    pub fn begin(&mut self) -> Result<(), RunError> {
        let mut control = self.shared.lock();
        match control.state {
            RunState::Configuring if self.source.is_some() => {}
            RunState::Idle | RunState::Configuring => return Err(RunError::NotConfigured),
            other => return Err(RunError::InvalidState(other)),
        }
        control.state = RunState::Running;
        drop(control);
        self.counters = Counters::default();
        if let Some(source) = &self.source {
            info!("run started on {}", source.describe());
        }
        Ok(())
    }

    /// One loop iteration: stop check, read, select, analyze, deliver.
    pub fn step<C>(&mut self, consumer: &mut C) -> Result<Step, RunError>
    where
        C: FrameConsumer + ?Sized,
    {
        let state = self.state();
        if !state.is_running() {
            return Err(RunError::InvalidState(state));
        }
        if self.shared.stop.load(Ordering::SeqCst) {
            return Ok(Step::Finished(self.finish(RunEnd::Stopped, consumer)));
        }

        // Snapshot, then release the lock before the blocking read.
        let (config, selection, revision) = {
            let control = self.shared.lock();
            (control.analysis.clone(), control.selection.clone(), control.reset_revision)
        };

        let Some(source) = self.source.as_mut() else {
            return Ok(Step::Finished(self.finish(RunEnd::EndOfStream, consumer)));
        };
        let frame = match source.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(Step::Finished(self.finish(RunEnd::EndOfStream, consumer))),
            Err(err) => return Ok(Step::Finished(self.read_failed(err, consumer))),
        };
        self.counters.frames_read += 1;
        if let Some(reason) = frame.error.clone() {
            return Ok(Step::Finished(self.read_failed(ReadError::Source(reason), consumer)));
        }
        // Selection indexes traces by label position.
        if !frame.is_consistent() {
            let err = AnalysisError::MalformedFrame(frame.shape_summary());
            warn!("dropping frame {:?}: {err}", frame.sequence);
            self.counters.analysis_errors += 1;
            consumer.analysis_failed(&err);
            return Ok(Step::Continue);
        }

        let selected = match select_channels(frame, &selection) {
            Selection::Selected(selected) => selected,
            Selection::Empty => {
                debug!("no selected channel in frame, skipping");
                self.counters.frames_skipped += 1;
                return Ok(Step::Continue);
            }
        };

        match self.analyzer.process(&selected.frame, &config) {
            Ok(mut analyzed) => {
                analyzed.channel_indices = selected.indices;
                consumer.deliver(analyzed);
                self.counters.frames_delivered += 1;
                self.reset_honored(&config, revision);
            }
            Err(err) => {
                warn!("analysis failed for frame {:?}: {err}", selected.frame.sequence);
                self.counters.analysis_errors += 1;
                consumer.analysis_failed(&err);
                if err == AnalysisError::PileupRejected {
                    self.reset_honored(&config, revision);
                }
            }
        }
        Ok(Step::Continue)
    }

    /// `begin` followed by `step` until the run ends.
    pub fn run<C>(&mut self, consumer: &mut C) -> Result<RunSummary, RunError>
    where
        C: FrameConsumer + ?Sized,
    {
        self.begin()?;
        loop {
            if let Step::Finished(summary) = self.step(&mut *consumer)? {
                return Ok(summary);
            }
        }
    }

    pub fn stop(&self) {
        self.handle().stop();
    }

    pub fn update_analysis_config(&self, update: &AnalysisUpdate) -> Result<bool, ConfigError> {
        self.handle().update_analysis_config(update)
    }

    pub fn select_channels(&self, selection: ChannelSelection) {
        self.handle().select_channels(selection);
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn state(&self) -> RunState {
        self.shared.lock().state
    }

    fn reset_honored(&self, config: &AnalysisConfig, revision: u64) {
        if !config.reset_accumulator {
            return;
        }
        let mut control = self.shared.lock();
        if control.reset_revision == revision {
            control.analysis.reset_accumulator = false;
        }
    }

    fn read_failed<C>(&mut self, err: ReadError, consumer: &mut C) -> RunSummary
    where
        C: FrameConsumer + ?Sized,
    {
        warn!("read failed, ending run: {err}");
        self.finish(RunEnd::ReadFailed(err.to_string()), consumer)
    }

    fn finish<C>(&mut self, end: RunEnd, consumer: &mut C) -> RunSummary
    where
        C: FrameConsumer + ?Sized,
    {
        self.close_source();
        self.analyzer.reset();
        self.shared.lock().state = RunState::Stopped;
        let summary = RunSummary {
            frames_read: self.counters.frames_read,
            frames_delivered: self.counters.frames_delivered,
            frames_skipped: self.counters.frames_skipped,
            analysis_errors: self.counters.analysis_errors,
            end,
        };
        info!(
            "run ended ({:?}): {} read, {} delivered, {} skipped, {} analysis errors",
            summary.end,
            summary.frames_read,
            summary.frames_delivered,
            summary.frames_skipped,
            summary.analysis_errors
        );
        consumer.run_ended(&summary);
        summary
    }

    fn close_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            debug!("closing {}", source.describe());
            source.close();
        }
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        self.close_source();
    }
}

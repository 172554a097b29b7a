// src/types.rs
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::drivers::error::ConfigError;
use crate::drivers::feed::FeedHandle;

/// Source-side channel number (ADC channel index).
pub type ChannelId = u32;

/// Upper bound on the running-average window (matches the bench UI spin box).
pub const MAX_WINDOW_SIZE: usize = 20_000;

// Raw -> physical conversion: physical = raw * scale + offset
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitConversion {
    pub scale: f64,
    pub offset: f64,
}

impl UnitConversion {
    pub const IDENTITY: UnitConversion = UnitConversion {
        scale: 1.0,
        offset: 0.0,
    };

    /// Conversion for a signed 16-bit ADC spanning `[voltage_min, voltage_max]`.
    pub fn for_adc_range(voltage_min: f64, voltage_max: f64) -> Self {
        Self {
            scale: (voltage_max - voltage_min) / 65_536.0,
            offset: (voltage_max + voltage_min) / 2.0,
        }
    }

    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.scale + self.offset
    }
}

impl Default for UnitConversion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// One multi-channel batch of samples delivered by a source.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub sample_rate_hz: f64,
    pub channels: Vec<ChannelId>,
    pub samples: Vec<Vec<f64>>, // channels x samples
    pub conversions: Vec<UnitConversion>,
    pub sequence: Option<u64>,
    pub error: Option<String>,
}

impl Frame {
    pub fn new(sample_rate_hz: f64, channels: Vec<ChannelId>, samples: Vec<Vec<f64>>) -> Self {
        let conversions = vec![UnitConversion::IDENTITY; channels.len()];
        Self {
            sample_rate_hz,
            channels,
            samples,
            conversions,
            sequence: None,
            error: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_conversions(mut self, conversions: Vec<UnitConversion>) -> Self {
        self.conversions = conversions;
        self
    }

    pub fn num_channels(&self) -> usize {
        self.samples.len()
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn shape_summary(&self) -> String {
        let lengths: Vec<usize> = self.samples.iter().map(Vec::len).collect();
        format!(
            "{} labels, {} conversions, trace lengths {:?}",
            self.channels.len(),
            self.conversions.len(),
            lengths
        )
    }

    /// Checks the per-frame shape invariants: one label, one conversion and
    /// one equally long sample sequence per channel.
    pub fn is_consistent(&self) -> bool {
        let n = self.samples_per_channel();
        self.channels.len() == self.samples.len()
            && self.conversions.len() == self.samples.len()
            && self.samples.iter().all(|c| c.len() == n)
    }
}

/// Ordered set of channels the operator wants to look at.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSelection(Vec<ChannelId>);

impl ChannelSelection {
    pub fn new(channels: impl IntoIterator<Item = ChannelId>) -> Self {
        let mut ids: Vec<ChannelId> = Vec::new();
        for id in channels {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Self(ids)
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.0.contains(&id)
    }

    pub fn ids(&self) -> &[ChannelId] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    /// ADC counts as delivered by the source.
    #[default]
    Raw,
    /// Volts, through the source-provided conversion.
    Physical,
}

impl Unit {
    pub fn label(&self) -> &'static str {
        match self {
            Unit::Raw => "ADC",
            Unit::Physical => "V",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Normalization {
    #[default]
    None,
    ByArea,
    ByReference { channel: ChannelId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveShape {
    Sine,
    Square,
    Triangle,
}

/// Signal-generator settings driving the sensor in transfer-function mode.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Excitation {
    pub shape: WaveShape,
    pub frequency_hz: f64,
    /// Peak amplitude.
    pub amplitude: f64,
    #[serde(default)]
    pub offset: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunningAverage {
    pub enabled: bool,
    pub window_size: usize,
}

impl Default for RunningAverage {
    fn default() -> Self {
        Self {
            enabled: false,
            window_size: 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub unit: Unit,
    pub normalization: Normalization,
    pub compute_psd: bool,
    pub compute_derivative_response: bool,
    pub pileup_rejection: bool,
    pub running_average: RunningAverage,
    pub excitation: Option<Excitation>,
    pub reset_accumulator: bool,
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_window(self.running_average.window_size)
    }

    /// Applies a partial update. Returns whether a semantic field changed, in
    /// which case `reset_accumulator` has been raised.
    pub fn apply(&mut self, update: &AnalysisUpdate) -> Result<bool, ConfigError> {
        update.validate()?;
        let mut semantic = false;
        if let Some(unit) = update.unit {
            semantic |= unit != self.unit;
            self.unit = unit;
        }
        if let Some(normalization) = &update.normalization {
            semantic |= *normalization != self.normalization;
            self.normalization = normalization.clone();
        }
        if let Some(psd) = update.compute_psd {
            semantic |= psd != self.compute_psd;
            self.compute_psd = psd;
        }
        if let Some(derivative) = update.compute_derivative_response {
            semantic |= derivative != self.compute_derivative_response;
            self.compute_derivative_response = derivative;
        }
        if let Some(pileup) = update.pileup_rejection {
            semantic |= pileup != self.pileup_rejection;
            self.pileup_rejection = pileup;
        }
        if let Some(excitation) = update.excitation {
            semantic |= Some(excitation) != self.excitation;
            self.excitation = Some(excitation);
        }
        if let Some(enabled) = update.running_average_enabled {
            self.running_average.enabled = enabled;
        }
        if let Some(window) = update.window_size {
            self.running_average.window_size = window;
        }
        if semantic || update.reset_accumulator {
            self.reset_accumulator = true;
        }
        Ok(semantic)
    }
}

fn validate_window(window_size: usize) -> Result<(), ConfigError> {
    if window_size == 0 || window_size > MAX_WINDOW_SIZE {
        return Err(ConfigError::InvalidWindow {
            window_size,
            max: MAX_WINDOW_SIZE,
        });
    }
    Ok(())
}

/// Partial analysis update; `None` leaves a field as it is.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisUpdate {
    pub unit: Option<Unit>,
    pub normalization: Option<Normalization>,
    pub compute_psd: Option<bool>,
    pub compute_derivative_response: Option<bool>,
    pub pileup_rejection: Option<bool>,
    pub excitation: Option<Excitation>,
    pub running_average_enabled: Option<bool>,
    pub window_size: Option<usize>,
    pub reset_accumulator: bool,
}

impl AnalysisUpdate {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(window) = self.window_size {
            validate_window(window)?;
        }
        if let Some(excitation) = &self.excitation {
            if !(excitation.frequency_hz > 0.0) || !(excitation.amplitude.abs() > 0.0) {
                return Err(ConfigError::InvalidExcitation(format!(
                    "frequency {} Hz, amplitude {}",
                    excitation.frequency_hz, excitation.amplitude
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Free-running acquisition paced by the sample clock.
    Continuous,
    #[default]
    External,
    Threshold,
}

/// Which backend a run pulls frames from. Immutable once a run starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SourceConfig {
    Device {
        adc_name: String,
        #[serde(default)]
        channels: Vec<ChannelId>,
        #[serde(default)]
        sample_rate_hz: Option<f64>,
        /// Trace length in milliseconds.
        #[serde(default)]
        trace_length_ms: Option<f64>,
        #[serde(default)]
        voltage_min: Option<f64>,
        #[serde(default)]
        voltage_max: Option<f64>,
        #[serde(default)]
        trigger: Option<TriggerKind>,
    },
    Replay {
        files: Vec<PathBuf>,
        #[serde(default)]
        looping: bool,
    },
    #[serde(skip)]
    Feed(FeedHandle),
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Device { .. } => "device",
            SourceConfig::Replay { .. } => "replay",
            SourceConfig::Feed(_) => "feed",
        }
    }
}

/// Result of one analyzer pass.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalyzedFrame {
    pub sample_rate_hz: f64,
    pub channels: Vec<ChannelId>,
    /// Positions of `channels` in the source frame.
    pub channel_indices: Vec<usize>,
    pub sequence: Option<u64>,
    pub unit: Unit,
    /// Time-domain traces, or PSD (unit^2/Hz) when `frequencies_hz` is set.
    pub data: Vec<Vec<f64>>,
    pub frequencies_hz: Option<Arc<[f64]>>,
    pub transfer: Option<Vec<TransferFunction>>,
    /// Frames currently contributing to `data`.
    pub averaged_frames: usize,
    pub pileup_rejected: bool,
}

impl AnalyzedFrame {
    pub fn is_spectrum(&self) -> bool {
        self.frequencies_hz.is_some()
    }

    /// Square root of the PSD, in unit/sqrt(Hz). `None` for time-domain frames.
    pub fn amplitude_spectral_density(&self) -> Option<Vec<Vec<f64>>> {
        self.frequencies_hz.as_ref()?;
        Some(
            self.data
                .iter()
                .map(|channel| channel.iter().map(|p| p.max(0.0).sqrt()).collect())
                .collect(),
        )
    }

    /// Sample times in milliseconds for time-domain display.
    pub fn time_axis_ms(&self) -> Vec<f64> {
        let n = self.data.first().map(|c| c.len()).unwrap_or(0);
        let dt_ms = 1e3 / self.sample_rate_hz;
        (0..n).map(|i| i as f64 * dt_ms).collect()
    }

    pub fn y_label(&self) -> String {
        if self.is_spectrum() {
            format!("{}/rtHz", self.unit.label())
        } else {
            self.unit.label().to_owned()
        }
    }
}

/// Small-signal response of one channel at the excitation harmonics.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferFunction {
    pub channel: ChannelId,
    pub frequencies_hz: Vec<f64>,
    pub magnitude: Vec<f64>,
    pub phase_rad: Vec<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Configuring,
    Running,
    StopRequested,
    Stopped,
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running | RunState::StopRequested)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunEnd {
    /// The operator asked the loop to stop.
    Stopped,
    EndOfStream,
    ReadFailed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_read: u64,
    pub frames_delivered: u64,
    /// Frames with no selected channel.
    pub frames_skipped: u64,
    pub analysis_errors: u64,
    pub end: RunEnd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_defaults_to_external() {
        assert_eq!(TriggerKind::default(), TriggerKind::External);
        let parsed: TriggerKind = serde_json::from_str("\"threshold\"").unwrap();
        assert_eq!(parsed, TriggerKind::Threshold);
    }

    #[test]
    fn semantic_update_raises_reset() {
        let mut cfg = AnalysisConfig::default();
        let changed = cfg
            .apply(&AnalysisUpdate {
                compute_psd: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert!(changed);
        assert!(cfg.reset_accumulator);
    }

    #[test]
    fn window_update_does_not_reset() {
        let mut cfg = AnalysisConfig::default();
        let changed = cfg
            .apply(&AnalysisUpdate {
                running_average_enabled: Some(true),
                window_size: Some(8),
                ..Default::default()
            })
            .unwrap();
        assert!(!changed);
        assert!(!cfg.reset_accumulator);
        assert_eq!(cfg.running_average.window_size, 8);
    }

    #[test]
    fn rejected_update_leaves_config_untouched() {
        let mut cfg = AnalysisConfig::default();
        let err = cfg.apply(&AnalysisUpdate {
            unit: Some(Unit::Physical),
            window_size: Some(0),
            ..Default::default()
        });
        assert!(err.is_err());
        assert_eq!(cfg, AnalysisConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<AnalysisConfig, _> =
            serde_json::from_str(r#"{"unit":"physical","calc_psd":true}"#);
        assert!(parsed.is_err());
        let parsed: AnalysisConfig =
            serde_json::from_str(r#"{"unit":"physical","compute_psd":true}"#).unwrap();
        assert_eq!(parsed.unit, Unit::Physical);
        assert!(parsed.compute_psd);
    }

    #[test]
    fn selection_drops_duplicates_and_keeps_order() {
        let sel = ChannelSelection::new([3, 1, 3, 2]);
        assert_eq!(sel.ids(), &[3, 1, 2]);
    }

    #[test]
    fn adc_conversion_spans_range() {
        let conv = UnitConversion::for_adc_range(-2.0, 2.0);
        assert!((conv.apply(32_768.0) - 2.0).abs() < 1e-12);
        assert_eq!(conv.apply(0.0), 0.0);
    }
}

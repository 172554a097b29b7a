use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::drivers::error::{ConfigError, OpenError};
use crate::types::{ChannelId, TriggerKind, UnitConversion};

/// Sample-clock range accepted for a device run.
pub const SAMPLE_RATE_RANGE_HZ: (f64, f64) = (1.0, 1e9);
/// Largest trace a single acquisition buffer may hold, per channel.
pub const MAX_SAMPLES_PER_TRACE: usize = 10_000_000;

/// Static description of one ADC on the bench.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdcSetup {
    pub sample_rate_hz: f64,
    pub samples_per_trace: usize,
    pub voltage_min: f64,
    pub voltage_max: f64,
    #[serde(default)]
    pub trigger: TriggerKind,
    /// Channels wired on this device.
    pub channels: Vec<ChannelId>,
}

impl Default for AdcSetup {
    fn default() -> Self {
        Self {
            sample_rate_hz: 1_250_000.0,
            samples_per_trace: 10_000,
            voltage_min: -5.0,
            voltage_max: 5.0,
            trigger: TriggerKind::External,
            channels: (0..8).collect(),
        }
    }
}

/// Bench-wide device table, passed explicitly to whoever needs it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchConfig {
    pub adc: BTreeMap<String, AdcSetup>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        let mut adc = BTreeMap::new();
        adc.insert("adc1".to_owned(), AdcSetup::default());
        Self { adc }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read bench config {}", path.display()))?;
        let config: BenchConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse bench config {}", path.display()))?;
        Ok(config)
    }

    pub fn adc_names(&self) -> impl Iterator<Item = &str> {
        self.adc.keys().map(String::as_str)
    }

    pub fn adc_setup(&self, name: &str) -> Option<&AdcSetup> {
        self.adc.get(name)
    }

    /// Merges explicit device parameters over the named ADC's defaults.
    pub fn resolve_device(&self, request: &DeviceRequest) -> Result<DeviceSettings, ConfigError> {
        if request.adc_name.is_empty() {
            return Err(ConfigError::MissingParameter("adc_name"));
        }
        if request.channels.is_empty() {
            return Err(ConfigError::MissingParameter("channels"));
        }
        let setup = self
            .adc_setup(&request.adc_name)
            .ok_or_else(|| OpenError::UnknownDevice(request.adc_name.clone()))?;
        if let Some(&channel) = request.channels.iter().find(|c| !setup.channels.contains(c)) {
            return Err(OpenError::UnknownChannel {
                adc: request.adc_name.clone(),
                channel,
            }
            .into());
        }

        let sample_rate_hz = request.sample_rate_hz.unwrap_or(setup.sample_rate_hz);
        let (min_rate, max_rate) = SAMPLE_RATE_RANGE_HZ;
        if !(min_rate..=max_rate).contains(&sample_rate_hz) {
            return Err(ConfigError::InvalidParameter {
                name: "sample_rate_hz",
                reason: format!("must be within {min_rate}..={max_rate} Hz, got {sample_rate_hz}"),
            });
        }
        // Computed in f64 so NaN and overflow are caught before the cast.
        let samples = match request.trace_length_ms {
            Some(ms) => (sample_rate_hz * ms / 1000.0).round(),
            None => setup.samples_per_trace as f64,
        };
        if !(1.0..=MAX_SAMPLES_PER_TRACE as f64).contains(&samples) {
            return Err(ConfigError::InvalidParameter {
                name: "trace_length_ms",
                reason: format!("trace must hold 1..={MAX_SAMPLES_PER_TRACE} samples, got {samples}"),
            });
        }
        let samples_per_trace = samples as usize;
        let voltage_min = request.voltage_min.unwrap_or(setup.voltage_min);
        let voltage_max = request.voltage_max.unwrap_or(setup.voltage_max);
        if voltage_max <= voltage_min {
            return Err(ConfigError::InvalidParameter {
                name: "voltage_max",
                reason: format!("{voltage_max} V is not above voltage_min {voltage_min} V"),
            });
        }

        Ok(DeviceSettings {
            adc_name: request.adc_name.clone(),
            channels: request.channels.clone(),
            sample_rate_hz,
            samples_per_trace,
            voltage_min,
            voltage_max,
            trigger: request.trigger.unwrap_or(setup.trigger),
        })
    }
}

/// Device parameters as requested by the operator; unset fields fall back to
/// the bench defaults.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceRequest {
    pub adc_name: String,
    pub channels: Vec<ChannelId>,
    pub sample_rate_hz: Option<f64>,
    pub trace_length_ms: Option<f64>,
    pub voltage_min: Option<f64>,
    pub voltage_max: Option<f64>,
    pub trigger: Option<TriggerKind>,
}

/// Fully resolved acquisition parameters handed to the ADC driver.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSettings {
    pub adc_name: String,
    pub channels: Vec<ChannelId>,
    pub sample_rate_hz: f64,
    pub samples_per_trace: usize,
    pub voltage_min: f64,
    pub voltage_max: f64,
    pub trigger: TriggerKind,
}

impl DeviceSettings {
    pub fn conversion(&self) -> UnitConversion {
        UnitConversion::for_adc_range(self.voltage_min, self.voltage_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn request(channels: Vec<ChannelId>) -> DeviceRequest {
        DeviceRequest {
            adc_name: "adc1".into(),
            channels,
            ..Default::default()
        }
    }

    #[test]
    fn trace_length_converts_to_samples() {
        let bench = BenchConfig::default();
        let mut req = request(vec![0, 1]);
        req.sample_rate_hz = Some(1_000_000.0);
        req.trace_length_ms = Some(2.5);
        let settings = bench.resolve_device(&req).unwrap();
        assert_eq!(settings.samples_per_trace, 2500);
        assert_eq!(settings.voltage_min, -5.0);
    }

    #[test]
    fn absurd_rates_and_lengths_are_rejected() {
        let bench = BenchConfig::default();
        for rate in [1e-20, 0.0, -1.0, f64::NAN, f64::INFINITY, 1e12] {
            let mut req = request(vec![0]);
            req.sample_rate_hz = Some(rate);
            assert!(matches!(
                bench.resolve_device(&req),
                Err(ConfigError::InvalidParameter { name: "sample_rate_hz", .. })
            ));
        }
        for ms in [1e12, f64::NAN, 0.0, -5.0] {
            let mut req = request(vec![0]);
            req.trace_length_ms = Some(ms);
            assert!(matches!(
                bench.resolve_device(&req),
                Err(ConfigError::InvalidParameter { name: "trace_length_ms", .. })
            ));
        }
    }

    #[test]
    fn missing_channels_and_unknown_adc() {
        let bench = BenchConfig::default();
        assert!(matches!(
            bench.resolve_device(&request(vec![])),
            Err(ConfigError::MissingParameter("channels"))
        ));
        let mut req = request(vec![0]);
        req.adc_name = "adc9".into();
        assert!(matches!(
            bench.resolve_device(&req),
            Err(ConfigError::Open(OpenError::UnknownDevice(_)))
        ));
        assert!(matches!(
            bench.resolve_device(&request(vec![42])),
            Err(ConfigError::Open(OpenError::UnknownChannel { channel: 42, .. }))
        ));
    }

    #[test]
    fn load_rejects_unknown_keys() {
        let mut good = tempfile::NamedTempFile::new().unwrap();
        write!(
            good,
            r#"{{"adc":{{"adc2":{{"sample_rate_hz":625000.0,"samples_per_trace":4096,
                "voltage_min":-1.0,"voltage_max":1.0,"channels":[0,1,2,3]}}}}}}"#
        )
        .unwrap();
        let bench = BenchConfig::load(good.path()).unwrap();
        assert_eq!(bench.adc_names().collect::<Vec<_>>(), vec!["adc2"]);
        assert_eq!(bench.adc_setup("adc2").unwrap().trigger, TriggerKind::External);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, r#"{{"adc":{{}},"redis":true}}"#).unwrap();
        assert!(BenchConfig::load(bad.path()).is_err());
    }
}

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DeviceSettings;
use crate::drivers::error::{OpenError, ReadError};
use crate::drivers::source::SourceAdapter;
use crate::types::{Frame, TriggerKind};

/// Hardware-facing acquisition driver. Implementations talk to the vendor
/// library; the engine only sees this contract.
pub trait AdcDriver: Send {
    fn start_task(&mut self, settings: &DeviceSettings) -> Result<()>;
    /// Blocks until one triggered buffer is complete. `buffer` is
    /// channels x samples, pre-sized from the settings.
    fn read_event(&mut self, buffer: &mut [Vec<i16>]) -> Result<()>;
    /// Releases the acquisition task. Must tolerate being called on a task
    /// that failed to start.
    fn clear_task(&mut self);
}

/// Produces a fresh driver for the named ADC at `configure` time.
pub trait DriverFactory: Send + Sync {
    fn create(&self, adc_name: &str) -> Result<Box<dyn AdcDriver>, OpenError>;
}

/// Device backend: one triggered acquisition buffer per frame.
pub struct DeviceSource {
    driver: Box<dyn AdcDriver>,
    settings: DeviceSettings,
    buffer: Vec<Vec<i16>>,
    events: u64,
    released: bool,
}

impl DeviceSource {
    pub fn open(settings: DeviceSettings, mut driver: Box<dyn AdcDriver>) -> Result<Self, OpenError> {
        if let Err(err) = driver.start_task(&settings) {
            driver.clear_task();
            return Err(OpenError::Device(format!("{err:#}")));
        }
        info!(
            "ADC {} armed: {} channels, {} samples @ {} Hz",
            settings.adc_name,
            settings.channels.len(),
            settings.samples_per_trace,
            settings.sample_rate_hz
        );
        let buffer = vec![vec![0i16; settings.samples_per_trace]; settings.channels.len()];
        Ok(Self {
            driver,
            settings,
            buffer,
            events: 0,
            released: false,
        })
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    fn release(&mut self) {
        if !self.released {
            self.driver.clear_task();
            self.released = true;
            debug!("ADC {} task cleared", self.settings.adc_name);
        }
    }
}

impl SourceAdapter for DeviceSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, ReadError> {
        if self.released {
            return Ok(None);
        }
        self.driver
            .read_event(&mut self.buffer)
            .map_err(|e| ReadError::Device(format!("{e:#}")))?;
        let samples = self
            .buffer
            .iter()
            .map(|channel| channel.iter().map(|&v| f64::from(v)).collect())
            .collect();
        let conversion = self.settings.conversion();
        let frame = Frame::new(
            self.settings.sample_rate_hz,
            self.settings.channels.clone(),
            samples,
        )
        .with_conversions(vec![conversion; self.settings.channels.len()])
        .with_sequence(self.events);
        self.events += 1;
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.release();
    }

    fn describe(&self) -> String {
        format!("device {}", self.settings.adc_name)
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Timer-paced stand-in for an ADC: gaussian baseline noise with one
/// triggered pulse per event, optionally a piled-up pulse ahead of it.
pub struct SimulatedAdc {
    rng: StdRng,
    settings: Option<DeviceSettings>,
    paced: bool,
    pileup_every: Option<u64>,
    noise_counts: f64,
    pulse_counts: f64,
    events: u64,
    last_event: Option<Instant>,
}

impl SimulatedAdc {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            settings: None,
            paced: false,
            pileup_every: None,
            noise_counts: 20.0,
            pulse_counts: 2_000.0,
            events: 0,
            last_event: None,
        }
    }

    /// Sleep so events arrive no faster than one trace length apart.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Inject a pulse in the pre-trigger region every `n` events.
    pub fn with_pileup_every(mut self, n: u64) -> Self {
        self.pileup_every = Some(n.max(1));
        self
    }

    fn gaussian(&mut self) -> f64 {
        // Box-Muller
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

fn pulse_shape(t: f64, rise: f64, fall: f64) -> f64 {
    if t < 0.0 {
        0.0
    } else {
        (-t / fall).exp() - (-t / rise).exp()
    }
}

impl AdcDriver for SimulatedAdc {
    fn start_task(&mut self, settings: &DeviceSettings) -> Result<()> {
        if settings.samples_per_trace == 0 {
            bail!("trace length is zero");
        }
        self.settings = Some(settings.clone());
        self.events = 0;
        self.last_event = None;
        Ok(())
    }

    fn read_event(&mut self, buffer: &mut [Vec<i16>]) -> Result<()> {
        let Some(settings) = self.settings.clone() else {
            bail!("acquisition task not started");
        };
        if self.paced {
            let period = Duration::try_from_secs_f64(
                settings.samples_per_trace as f64 / settings.sample_rate_hz,
            )
            .context("trace period out of range")?;
            if let Some(last) = self.last_event {
                let elapsed = last.elapsed();
                if elapsed < period {
                    thread::sleep(period - elapsed);
                }
            }
            self.last_event = Some(Instant::now());
        }

        let n = settings.samples_per_trace;
        let trigger_at = match settings.trigger {
            TriggerKind::Continuous => None,
            TriggerKind::External | TriggerKind::Threshold => Some(n as f64 * 0.4),
        };
        let piled_up = matches!(self.pileup_every, Some(k) if self.events % k == k - 1);
        let rise = (n as f64 / 500.0).max(1.0);
        let fall = (n as f64 / 50.0).max(2.0);
        for (idx, channel) in buffer.iter_mut().enumerate() {
            let gain = 1.0 / (1.0 + idx as f64 * 0.25);
            for (i, sample) in channel.iter_mut().enumerate() {
                let t = i as f64;
                let mut value = self.noise_counts * self.gaussian();
                if let Some(t0) = trigger_at {
                    value += self.pulse_counts * gain * pulse_shape(t - t0, rise, fall);
                }
                if piled_up {
                    value += self.pulse_counts * gain * pulse_shape(t - n as f64 * 0.05, rise, fall);
                }
                *sample = value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            }
        }
        self.events += 1;
        Ok(())
    }

    fn clear_task(&mut self) {
        self.settings = None;
    }
}

/// Hands out seeded `SimulatedAdc` drivers for any configured ADC name.
#[derive(Clone, Debug, Default)]
pub struct SimulatedDriverFactory {
    pub seed: u64,
    pub paced: bool,
    pub pileup_every: Option<u64>,
}

impl DriverFactory for SimulatedDriverFactory {
    fn create(&self, _adc_name: &str) -> Result<Box<dyn AdcDriver>, OpenError> {
        let mut adc = SimulatedAdc::new(self.seed).paced(self.paced);
        if let Some(n) = self.pileup_every {
            adc = adc.with_pileup_every(n);
        }
        Ok(Box::new(adc))
    }
}

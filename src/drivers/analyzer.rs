use log::debug;

use crate::drivers::buffer::RunningWindow;
use crate::drivers::error::AnalysisError;
use crate::drivers::fft::SpectrumBuilder;
use crate::drivers::pileup::{PileupDetector, PretriggerDetector};
use crate::drivers::transfer::{check_excitation, transfer_functions};
use crate::types::{AnalysisConfig, AnalyzedFrame, ChannelId, Frame, Normalization, Unit};

#[derive(Clone, Debug, PartialEq)]
struct Shape {
    channels: Vec<ChannelId>,
    len: usize,
    sample_rate_hz: f64,
}

impl Shape {
    fn of(frame: &Frame) -> Self {
        Self {
            channels: frame.channels.clone(),
            len: frame.samples_per_channel(),
            sample_rate_hz: frame.sample_rate_hz,
        }
    }
}

/// Stateful per-run processing chain: unit conversion, normalization,
/// pile-up rejection, running average, PSD and transfer-function estimate.
pub struct Analyzer {
    shape: Option<Shape>,
    window: RunningWindow,
    latest: Option<Vec<Vec<f64>>>,
    spectrum: SpectrumBuilder,
    pileup: Box<dyn PileupDetector>,
    resets: u64,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Self::with_pileup_detector(Box::new(PretriggerDetector::default()))
    }

    pub fn with_pileup_detector(pileup: Box<dyn PileupDetector>) -> Self {
        Self {
            shape: None,
            window: RunningWindow::new(1),
            latest: None,
            spectrum: SpectrumBuilder::new(),
            pileup,
            resets: 0,
        }
    }

    pub fn set_pileup_detector(&mut self, pileup: Box<dyn PileupDetector>) {
        self.pileup = pileup;
    }

    /// Discards all accumulated state.
    pub fn reset(&mut self) {
        self.shape = None;
        self.window.clear();
        self.latest = None;
        self.spectrum.clear_axis();
        self.resets += 1;
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn window(&self) -> &RunningWindow {
        &self.window
    }

    pub fn spectrum(&self) -> &SpectrumBuilder {
        &self.spectrum
    }

    pub fn process(
        &mut self,
        frame: &Frame,
        config: &AnalysisConfig,
    ) -> Result<AnalyzedFrame, AnalysisError> {
        // Everything that can fail runs before the state is touched.
        validate(frame)?;
        let mut traces = convert(frame, config.unit);
        normalize(&mut traces, frame, &config.normalization)?;
        let excitation = if config.compute_derivative_response {
            Some(check_excitation(config.excitation.as_ref(), frame.sample_rate_hz)?)
        } else {
            None
        };

        let shape = Shape::of(frame);
        if config.reset_accumulator || self.shape.as_ref() != Some(&shape) {
            debug!(
                "analyzer reset ({})",
                if config.reset_accumulator { "requested" } else { "frame shape changed" }
            );
            self.reset();
            self.shape = Some(shape);
        }
        if !config.compute_psd {
            self.spectrum.clear_axis();
        }

        let averaging = config.running_average.enabled;
        let rejected = config.pileup_rejection && self.pileup.is_pileup(&traces);
        let (data, averaged_frames) = if rejected {
            debug!("pile-up rejected frame {:?}", frame.sequence);
            match (averaging, &self.latest) {
                (true, _) if !self.window.is_empty() => (self.window.mean(), self.window.count()),
                (_, Some(latest)) => (latest.clone(), 1),
                _ => return Err(AnalysisError::PileupRejected),
            }
        } else if averaging {
            self.window.set_capacity(config.running_average.window_size);
            self.window.push(&traces);
            self.latest = Some(traces);
            (self.window.mean(), self.window.count())
        } else {
            self.latest = Some(traces.clone());
            (traces, 1)
        };

        let transfer = excitation.map(|exc| {
            transfer_functions(
                &mut self.spectrum,
                &frame.channels,
                &data,
                frame.sample_rate_hz,
                &exc,
            )
        });

        let (data, frequencies_hz) = if config.compute_psd {
            let (axis, psd) = self.spectrum.psd(&data, frame.sample_rate_hz);
            (psd, Some(axis))
        } else {
            (data, None)
        };

        Ok(AnalyzedFrame {
            sample_rate_hz: frame.sample_rate_hz,
            channels: frame.channels.clone(),
            channel_indices: (0..frame.num_channels()).collect(),
            sequence: frame.sequence,
            unit: config.unit,
            data,
            frequencies_hz,
            transfer,
            averaged_frames,
            pileup_rejected: rejected,
        })
    }
}

fn validate(frame: &Frame) -> Result<(), AnalysisError> {
    if frame.num_channels() == 0 || frame.samples_per_channel() == 0 {
        return Err(AnalysisError::EmptyFrame);
    }
    if !frame.is_consistent() {
        return Err(AnalysisError::MalformedFrame(frame.shape_summary()));
    }
    if !(frame.sample_rate_hz > 0.0) {
        return Err(AnalysisError::InvalidSampleRate(frame.sample_rate_hz));
    }
    Ok(())
}

fn convert(frame: &Frame, unit: Unit) -> Vec<Vec<f64>> {
    match unit {
        Unit::Raw => frame.samples.clone(),
        Unit::Physical => frame
            .samples
            .iter()
            .zip(&frame.conversions)
            .map(|(channel, conv)| channel.iter().map(|&v| conv.apply(v)).collect())
            .collect(),
    }
}

fn normalize(
    traces: &mut [Vec<f64>],
    frame: &Frame,
    normalization: &Normalization,
) -> Result<(), AnalysisError> {
    match normalization {
        Normalization::None => {}
        Normalization::ByArea => {
            let dt = 1.0 / frame.sample_rate_hz;
            for channel in traces.iter_mut() {
                let area = channel.iter().map(|v| v.abs()).sum::<f64>() * dt;
                if area > 0.0 {
                    channel.iter_mut().for_each(|v| *v /= area);
                }
            }
        }
        Normalization::ByReference { channel } => {
            let idx = frame
                .channels
                .iter()
                .position(|c| c == channel)
                .ok_or(AnalysisError::MissingReference(*channel))?;
            let peak = traces[idx].iter().map(|v| v.abs()).fold(0.0, f64::max);
            if peak == 0.0 {
                return Err(AnalysisError::ZeroReference(*channel));
            }
            for trace in traces.iter_mut() {
                trace.iter_mut().for_each(|v| *v /= peak);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::pileup::AmplitudeBandDetector;
    use crate::types::{Excitation, RunningAverage, UnitConversion, WaveShape};

    fn constant(value: f64, channels: usize, len: usize) -> Frame {
        Frame::new(
            1000.0,
            (0..channels as u32).collect(),
            vec![vec![value; len]; channels],
        )
    }

    fn averaging(window_size: usize) -> AnalysisConfig {
        AnalysisConfig {
            running_average: RunningAverage {
                enabled: true,
                window_size,
            },
            ..Default::default()
        }
    }

    #[test]
    fn running_average_scenario() {
        let mut analyzer = Analyzer::new();
        let cfg = averaging(4);
        let mut outputs = Vec::new();
        for v in [1.0, 3.0, 5.0, 7.0] {
            let out = analyzer.process(&constant(v, 2, 1000), &cfg).unwrap();
            assert!(out.data.iter().flatten().all(|x| *x == out.data[0][0]));
            outputs.push(out.data[0][0]);
        }
        assert_eq!(outputs, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn constant_input_is_a_fixed_point() {
        let mut analyzer = Analyzer::new();
        let cfg = averaging(3);
        let frame = Frame::new(500.0, vec![0, 1], vec![vec![0.25, -1.5, 3.0], vec![7.0, 7.0, -2.0]]);
        for _ in 0..10 {
            let out = analyzer.process(&frame, &cfg).unwrap();
            assert_eq!(out.data, frame.samples);
        }
        assert_eq!(analyzer.window().count(), 3);
    }

    #[test]
    fn reset_flag_discards_history() {
        let mut analyzer = Analyzer::new();
        let mut cfg = averaging(4);
        analyzer.process(&constant(10.0, 1, 8), &cfg).unwrap();
        cfg.reset_accumulator = true;
        let out = analyzer.process(&constant(2.0, 1, 8), &cfg).unwrap();
        assert_eq!(out.data[0], vec![2.0; 8]);
        assert_eq!(out.averaged_frames, 1);
    }

    #[test]
    fn shape_change_discards_history() {
        let mut analyzer = Analyzer::new();
        let cfg = averaging(4);
        analyzer.process(&constant(10.0, 2, 8), &cfg).unwrap();
        let out = analyzer.process(&constant(2.0, 2, 16), &cfg).unwrap();
        assert_eq!(out.data[0], vec![2.0; 16]);
        let out = analyzer.process(&constant(4.0, 1, 16), &cfg).unwrap();
        assert_eq!(out.data[0], vec![4.0; 16]);
        assert_eq!(analyzer.resets(), 3);
    }

    #[test]
    fn rejected_frames_leave_accumulator_alone() {
        let mut analyzer =
            Analyzer::with_pileup_detector(Box::new(AmplitudeBandDetector { min: -50.0, max: 50.0 }));
        let mut cfg = averaging(4);
        cfg.pileup_rejection = true;
        analyzer.process(&constant(1.0, 1, 8), &cfg).unwrap();
        let sum_before = analyzer.window().sum().to_vec();

        let out = analyzer.process(&constant(99.0, 1, 8), &cfg).unwrap();
        assert!(out.pileup_rejected);
        assert_eq!(out.data[0], vec![1.0; 8]);
        assert_eq!(analyzer.window().count(), 1);
        assert_eq!(analyzer.window().sum(), sum_before.as_slice());

        let out = analyzer.process(&constant(3.0, 1, 8), &cfg).unwrap();
        assert_eq!(out.data[0], vec![2.0; 8]);
        assert_eq!(out.averaged_frames, 2);
    }

    #[test]
    fn rejection_without_averaging_forwards_latest() {
        let mut analyzer =
            Analyzer::with_pileup_detector(Box::new(AmplitudeBandDetector { min: -50.0, max: 50.0 }));
        let cfg = AnalysisConfig {
            pileup_rejection: true,
            ..Default::default()
        };
        assert_eq!(
            analyzer.process(&constant(99.0, 1, 4), &cfg),
            Err(AnalysisError::PileupRejected)
        );
        analyzer.process(&constant(5.0, 1, 4), &cfg).unwrap();
        let out = analyzer.process(&constant(99.0, 1, 4), &cfg).unwrap();
        assert!(out.pileup_rejected);
        assert_eq!(out.data[0], vec![5.0; 4]);
    }

    #[test]
    fn physical_units_and_area_normalization() {
        let mut analyzer = Analyzer::new();
        let frame = Frame::new(10.0, vec![0], vec![vec![2.0, -2.0, 4.0, 0.0]])
            .with_conversions(vec![UnitConversion { scale: 0.5, offset: 1.0 }]);
        let cfg = AnalysisConfig {
            unit: Unit::Physical,
            ..Default::default()
        };
        let out = analyzer.process(&frame, &cfg).unwrap();
        assert_eq!(out.data[0], vec![2.0, 0.0, 3.0, 1.0]);
        assert_eq!(out.y_label(), "V");

        let cfg = AnalysisConfig {
            normalization: Normalization::ByArea,
            ..Default::default()
        };
        let out = analyzer.process(&frame, &cfg).unwrap();
        // sum |x| * dt = 8 * 0.1
        for (got, want) in out.data[0].iter().zip([2.5, -2.5, 5.0, 0.0]) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn reference_normalization_errors_keep_state() {
        let mut analyzer = Analyzer::new();
        let cfg = averaging(4);
        analyzer.process(&constant(6.0, 2, 4), &cfg).unwrap();
        let mut bad = cfg.clone();
        bad.normalization = Normalization::ByReference { channel: 7 };
        bad.reset_accumulator = true;
        assert_eq!(
            analyzer.process(&constant(6.0, 2, 4), &bad),
            Err(AnalysisError::MissingReference(7))
        );
        assert_eq!(analyzer.window().count(), 1);

        let good = AnalysisConfig {
            normalization: Normalization::ByReference { channel: 1 },
            ..Default::default()
        };
        let frame = Frame::new(1000.0, vec![0, 1], vec![vec![2.0; 4], vec![-4.0; 4]]);
        let out = analyzer.process(&frame, &good).unwrap();
        assert_eq!(out.data[1], vec![-1.0; 4]);
        assert_eq!(out.data[0], vec![0.5; 4]);
    }

    #[test]
    fn empty_frame_is_a_per_frame_error() {
        let mut analyzer = Analyzer::new();
        let cfg = AnalysisConfig {
            compute_psd: true,
            ..Default::default()
        };
        let empty = Frame::new(1000.0, vec![0], vec![vec![]]);
        assert_eq!(analyzer.process(&empty, &cfg), Err(AnalysisError::EmptyFrame));
        assert!(analyzer.process(&constant(1.0, 1, 8), &cfg).is_ok());
    }

    #[test]
    fn psd_of_constant_frame_is_zero_off_dc() {
        let mut analyzer = Analyzer::new();
        let mut cfg = averaging(4);
        cfg.compute_psd = true;
        let out = analyzer.process(&constant(5.0, 2, 1000), &cfg).unwrap();
        let freqs = out.frequencies_hz.clone().unwrap();
        assert_eq!(freqs.len(), 501);
        assert_eq!(freqs[1], 1.0);
        for channel in &out.data {
            assert!(channel[0] > 0.0);
            assert!(channel[1..].iter().all(|p| p.abs() < 1e-18));
        }
        assert_eq!(out.y_label(), "ADC/rtHz");
        assert!(out.amplitude_spectral_density().is_some());

        analyzer.process(&constant(5.0, 2, 1000), &cfg).unwrap();
        assert_eq!(analyzer.spectrum().axis_builds(), 1);
    }

    #[test]
    fn derivative_mode_reports_gain() {
        let mut analyzer = Analyzer::new();
        let exc = Excitation {
            shape: WaveShape::Sine,
            frequency_hz: 50.0,
            amplitude: 1.0,
            offset: 0.0,
        };
        let drive = crate::drivers::transfer::excitation_trace(&exc, 1000, 1000.0);
        let frame = Frame::new(1000.0, vec![4], vec![drive.iter().map(|v| 3.0 * v).collect()]);
        let cfg = AnalysisConfig {
            compute_derivative_response: true,
            excitation: Some(exc),
            ..Default::default()
        };
        let out = analyzer.process(&frame, &cfg).unwrap();
        let tf = &out.transfer.unwrap()[0];
        assert_eq!(tf.channel, 4);
        assert!((tf.magnitude[0] - 3.0).abs() < 1e-9);

        let missing = AnalysisConfig {
            compute_derivative_response: true,
            ..Default::default()
        };
        assert_eq!(
            analyzer.process(&frame, &missing),
            Err(AnalysisError::MissingExcitation)
        );
    }
}

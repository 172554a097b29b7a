//! Small-signal response of each channel to the signal-generator excitation.
//!
//! The excitation is synthesised over the frame from the generator settings
//! (phase zero at the first sample, the generator being the trigger source)
//! and the response is the complex ratio of the two spectra at each harmonic
//! the waveform carries.

use std::f64::consts::PI;

use crate::drivers::error::AnalysisError;
use crate::drivers::fft::SpectrumBuilder;
use crate::types::{ChannelId, Excitation, TransferFunction, WaveShape};

const MAX_HARMONICS: usize = 15;

pub fn excitation_trace(excitation: &Excitation, len: usize, sample_rate_hz: f64) -> Vec<f64> {
    (0..len)
        .map(|i| {
            let phase = 2.0 * PI * excitation.frequency_hz * i as f64 / sample_rate_hz;
            let unit = match excitation.shape {
                WaveShape::Sine => phase.sin(),
                WaveShape::Square => {
                    if phase.sin() >= 0.0 {
                        1.0
                    } else {
                        -1.0
                    }
                }
                WaveShape::Triangle => 2.0 / PI * phase.sin().asin(),
            };
            excitation.offset + excitation.amplitude * unit
        })
        .collect()
}

fn harmonics(shape: WaveShape) -> impl Iterator<Item = usize> {
    let odd_only = !matches!(shape, WaveShape::Sine);
    let count = if odd_only { MAX_HARMONICS } else { 1 };
    (0..count).map(move |i| if odd_only { 2 * i + 1 } else { 1 })
}

/// Fails before any work if the excitation cannot be resolved on this frame.
pub fn check_excitation(
    excitation: Option<&Excitation>,
    sample_rate_hz: f64,
) -> Result<Excitation, AnalysisError> {
    let excitation = excitation.copied().ok_or(AnalysisError::MissingExcitation)?;
    let nyquist_hz = sample_rate_hz / 2.0;
    if !(excitation.frequency_hz > 0.0) || excitation.frequency_hz >= nyquist_hz {
        return Err(AnalysisError::ExcitationOutOfBand {
            frequency_hz: excitation.frequency_hz,
            nyquist_hz,
        });
    }
    Ok(excitation)
}

pub fn transfer_functions(
    spectrum: &mut SpectrumBuilder,
    channels: &[ChannelId],
    traces: &[Vec<f64>],
    sample_rate_hz: f64,
    excitation: &Excitation,
) -> Vec<TransferFunction> {
    let len = traces.first().map(|t| t.len()).unwrap_or(0);
    let drive = spectrum.spectrum(&excitation_trace(excitation, len, sample_rate_hz));
    let floor = drive.iter().map(|c| c.norm()).fold(0.0, f64::max) * 1e-9;
    let bin_width = sample_rate_hz / len as f64;

    let bins: Vec<usize> = harmonics(excitation.shape)
        .map(|h| (h as f64 * excitation.frequency_hz / bin_width).round() as usize)
        .take_while(|&k| k > 0 && k < (len + 1) / 2)
        .filter(|&k| drive[k].norm() > floor)
        .collect();

    channels
        .iter()
        .zip(traces)
        .map(|(&channel, trace)| {
            let response = spectrum.spectrum(trace);
            let ratios: Vec<_> = bins.iter().map(|&k| response[k] / drive[k]).collect();
            TransferFunction {
                channel,
                frequencies_hz: bins.iter().map(|&k| k as f64 * bin_width).collect(),
                magnitude: ratios.iter().map(|z| z.norm()).collect(),
                phase_rad: ratios.iter().map(|z| z.arg()).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn excitation(shape: WaveShape) -> Excitation {
        Excitation {
            shape,
            frequency_hz: 10.0,
            amplitude: 0.5,
            offset: 0.0,
        }
    }

    #[test]
    fn scaled_sine_gives_flat_gain() {
        let exc = excitation(WaveShape::Sine);
        let drive = excitation_trace(&exc, 1000, 1000.0);
        let response: Vec<f64> = drive.iter().map(|v| 2.0 * v + 0.1).collect();
        let mut builder = SpectrumBuilder::new();
        let tf = transfer_functions(&mut builder, &[3], &[response], 1000.0, &exc);
        assert_eq!(tf[0].channel, 3);
        assert_eq!(tf[0].frequencies_hz, vec![10.0]);
        assert!((tf[0].magnitude[0] - 2.0).abs() < 1e-9);
        assert!(tf[0].phase_rad[0].abs() < 1e-9);
    }

    #[test]
    fn square_wave_reports_odd_harmonics() {
        let exc = excitation(WaveShape::Square);
        let drive = excitation_trace(&exc, 1000, 1000.0);
        let response: Vec<f64> = drive.iter().map(|v| -0.5 * v).collect();
        let mut builder = SpectrumBuilder::new();
        let tf = transfer_functions(&mut builder, &[0], &[response], 1000.0, &exc);
        assert!(tf[0].frequencies_hz.len() > 3);
        assert_eq!(&tf[0].frequencies_hz[..3], &[10.0, 30.0, 50.0]);
        for (mag, phase) in tf[0].magnitude.iter().zip(&tf[0].phase_rad) {
            assert!((mag - 0.5).abs() < 1e-9);
            assert!((phase.abs() - PI).abs() < 1e-9);
        }
    }

    #[test]
    fn out_of_band_excitation_is_rejected() {
        let mut exc = excitation(WaveShape::Sine);
        exc.frequency_hz = 600.0;
        assert!(matches!(
            check_excitation(Some(&exc), 1000.0),
            Err(AnalysisError::ExcitationOutOfBand { .. })
        ));
        assert_eq!(check_excitation(None, 1000.0), Err(AnalysisError::MissingExcitation));
    }
}

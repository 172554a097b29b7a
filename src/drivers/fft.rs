use std::sync::Arc;

use rustfft::{num_complex::Complex64, FftPlanner};

struct CachedAxis {
    len: usize,
    sample_rate_hz: f64,
    frequencies: Arc<[f64]>,
}

/// FFT helper holding the planner and the frequency axis of the last PSD.
pub struct SpectrumBuilder {
    planner: FftPlanner<f64>,
    axis: Option<CachedAxis>,
    axis_builds: u64,
}

impl Default for SpectrumBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrumBuilder {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            axis: None,
            axis_builds: 0,
        }
    }

    /// Forgets the cached frequency axis.
    pub fn clear_axis(&mut self) {
        self.axis = None;
    }

    pub fn has_axis_for(&self, len: usize, sample_rate_hz: f64) -> bool {
        matches!(&self.axis, Some(a) if a.len == len && a.sample_rate_hz == sample_rate_hz)
    }

    /// Number of times the frequency axis had to be computed.
    pub fn axis_builds(&self) -> u64 {
        self.axis_builds
    }

    /// One-sided frequency axis, `len / 2 + 1` bins.
    pub fn frequency_axis(&mut self, len: usize, sample_rate_hz: f64) -> Arc<[f64]> {
        if let Some(axis) = &self.axis {
            if axis.len == len && axis.sample_rate_hz == sample_rate_hz {
                return Arc::clone(&axis.frequencies);
            }
        }
        let step = sample_rate_hz / len as f64;
        let frequencies: Arc<[f64]> = (0..=len / 2).map(|k| k as f64 * step).collect();
        self.axis = Some(CachedAxis {
            len,
            sample_rate_hz,
            frequencies: Arc::clone(&frequencies),
        });
        self.axis_builds += 1;
        frequencies
    }

    /// Full complex spectrum of a real trace.
    pub fn spectrum(&mut self, trace: &[f64]) -> Vec<Complex64> {
        let fft = self.planner.plan_fft_forward(trace.len());
        let mut buffer: Vec<Complex64> = trace.iter().map(|&v| Complex64::new(v, 0.0)).collect();
        fft.process(&mut buffer);
        buffer
    }

    /// One-sided power spectral density (unit^2/Hz) of each trace, rectangular
    /// window. Interior bins are doubled so the sum over bins times the bin
    /// width equals the trace's mean square.
    pub fn psd(&mut self, traces: &[Vec<f64>], sample_rate_hz: f64) -> (Arc<[f64]>, Vec<Vec<f64>>) {
        let len = traces.first().map(|t| t.len()).unwrap_or(0);
        let axis = self.frequency_axis(len, sample_rate_hz);
        let norm = 1.0 / (sample_rate_hz * len as f64);
        let last = len / 2;
        let psd = traces
            .iter()
            .map(|trace| {
                let spectrum = self.spectrum(trace);
                spectrum
                    .iter()
                    .take(last + 1)
                    .enumerate()
                    .map(|(k, c)| {
                        let p = c.norm_sqr() * norm;
                        let nyquist_bin = len % 2 == 0 && k == last;
                        if k == 0 || nyquist_bin {
                            p
                        } else {
                            2.0 * p
                        }
                    })
                    .collect()
            })
            .collect();
        (axis, psd)
    }
}

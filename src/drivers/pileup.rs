/// Frame-level pile-up heuristic. Sees the processed (converted and
/// normalized) traces of every selected channel.
pub trait PileupDetector: Send {
    fn is_pileup(&self, traces: &[Vec<f64>]) -> bool;
}

/// Flags a pulse sitting in the pre-trigger region: the largest deviation
/// from the trace median within the first `pretrigger_fraction` of samples
/// exceeds `n_sigma` robust standard deviations (1.4826 x MAD) of the trace.
#[derive(Clone, Copy, Debug)]
pub struct PretriggerDetector {
    pub pretrigger_fraction: f64,
    pub n_sigma: f64,
}

impl Default for PretriggerDetector {
    fn default() -> Self {
        Self {
            pretrigger_fraction: 0.25,
            n_sigma: 5.0,
        }
    }
}

fn median(values: &mut [f64]) -> f64 {
    let mid = values.len() / 2;
    let (_, m, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    *m
}

impl PretriggerDetector {
    fn channel_piled_up(&self, trace: &[f64]) -> bool {
        let pretrigger = ((trace.len() as f64 * self.pretrigger_fraction) as usize).min(trace.len());
        if pretrigger == 0 {
            return false;
        }
        let mut scratch = trace.to_vec();
        let center = median(&mut scratch);
        for (s, v) in scratch.iter_mut().zip(trace) {
            *s = (v - center).abs();
        }
        let sigma = 1.4826 * median(&mut scratch);
        let excursion = trace[..pretrigger]
            .iter()
            .map(|v| (v - center).abs())
            .fold(0.0, f64::max);
        excursion > self.n_sigma * sigma
    }
}

impl PileupDetector for PretriggerDetector {
    fn is_pileup(&self, traces: &[Vec<f64>]) -> bool {
        traces.iter().any(|t| self.channel_piled_up(t))
    }
}

/// Out-of-band amplitude: any sample outside `[min, max]` rejects the frame.
#[derive(Clone, Copy, Debug)]
pub struct AmplitudeBandDetector {
    pub min: f64,
    pub max: f64,
}

impl PileupDetector for AmplitudeBandDetector {
    fn is_pileup(&self, traces: &[Vec<f64>]) -> bool {
        traces
            .iter()
            .flatten()
            .any(|v| *v < self.min || *v > self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline_with_pulse_at(len: usize, at: usize) -> Vec<f64> {
        (0..len)
            .map(|i| {
                let noise = if i % 2 == 0 { 1.0 } else { -1.0 };
                let pulse = if i >= at && i < at + 20 { 100.0 } else { 0.0 };
                noise + pulse
            })
            .collect()
    }

    #[test]
    fn pulse_after_trigger_is_accepted() {
        let det = PretriggerDetector::default();
        assert!(!det.is_pileup(&[baseline_with_pulse_at(400, 160)]));
        assert!(!det.is_pileup(&[vec![1.0; 400]]));
    }

    #[test]
    fn pulse_before_trigger_is_rejected() {
        let det = PretriggerDetector::default();
        let clean = baseline_with_pulse_at(400, 160);
        let piled = baseline_with_pulse_at(400, 20);
        assert!(det.is_pileup(&[clean, piled]));
    }

    #[test]
    fn band_detector() {
        let det = AmplitudeBandDetector { min: -5.0, max: 5.0 };
        assert!(!det.is_pileup(&[vec![0.0, 4.9, -5.0]]));
        assert!(det.is_pileup(&[vec![0.0], vec![5.1]]));
    }
}

use std::collections::VecDeque;

const WINDOW: usize = 5;
const LOW_SUCCESS: f64 = 0.3;
const HIGH_SUCCESS: f64 = 0.7;
const STEP_DOWN: f64 = 0.9;
const STEP_UP: f64 = 1.1;
pub(crate) const MIN_MULTIPLIER: f64 = 0.5;
pub(crate) const MAX_MULTIPLIER: f64 = 2.0;

/// "Expected progress" per attempt, tuned by a rolling average of recent progress ratios.
///
/// The multiplier moves by a fixed step and is clamped, so the threshold always stays
/// within `[base * 0.5, base * 2.0]`.
#[derive(Debug, Clone)]
pub(crate) struct AdaptiveThreshold {
    base: f64,
    multiplier: f64,
    ratios: VecDeque<f64>,
}

impl AdaptiveThreshold {
    pub(crate) fn new(base_chars: usize) -> Self {
        Self {
            base: base_chars as f64,
            multiplier: 1.0,
            ratios: VecDeque::with_capacity(WINDOW),
        }
    }

    pub(crate) fn observe(&mut self, progress_chars: usize) {
        let ratio = if self.base <= 0.0 {
            1.0
        } else {
            (progress_chars as f64 / self.base).min(1.0)
        };
        if self.ratios.len() == WINDOW {
            self.ratios.pop_front();
        }
        self.ratios.push_back(ratio);

        let average = self.ratios.iter().sum::<f64>() / self.ratios.len() as f64;
        if average < LOW_SUCCESS {
            self.multiplier *= STEP_DOWN;
        } else if average > HIGH_SUCCESS {
            self.multiplier *= STEP_UP;
        }
        self.multiplier = self.multiplier.clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);
    }

    pub(crate) fn current(&self) -> f64 {
        self.base * self.multiplier
    }

    #[cfg(test)]
    pub(crate) fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

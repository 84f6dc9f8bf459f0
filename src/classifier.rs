//! Probability to label decision at an operating threshold

use crate::types::classification::Label;

/// Label and confidence for one probability
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub label: Label,
    pub confidence: f64,
    /// Threshold actually applied
    pub threshold: f64,
}

/// Applies the model's operating threshold, or an operator override of it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdClassifier {
    threshold_override: Option<f64>,
}

impl ThresholdClassifier {
    pub fn new(threshold_override: Option<f64>) -> Self {
        Self { threshold_override }
    }

    pub fn threshold_override(&self) -> Option<f64> {
        self.threshold_override
    }

    /// Anomaly iff `probability >= threshold`
    pub fn classify(&self, probability: f64, model_threshold: f64) -> Decision {
        let threshold = self.threshold_override.unwrap_or(model_threshold);
        if probability >= threshold {
            Decision {
                label: Label::Anomaly,
                confidence: probability,
                threshold,
            }
        } else {
            Decision {
                label: Label::Normal,
                confidence: 1.0 - probability,
                threshold,
            }
        }
    }
}

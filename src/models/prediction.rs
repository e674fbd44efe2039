use serde::{Deserialize, Serialize};

/// One entry of a job's persisted prediction list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub prob: f64,
}

/// A decoded model output: label-space index, label and probability.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPrediction {
    pub index: usize,
    pub label: String,
    pub probability: f32,
}

/// Accumulated score for one coarse category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryScore {
    pub category: &'static str,
    pub score: f64,
}

/// Successful result of one analysis run, ready to be written into a job.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub label: String,
    pub best_score: f64,
    pub top_predictions: Vec<Prediction>,
}

/// Replace NaN and infinities with 0.0 so the value can be stored as JSON.
pub fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

//! Inference engine.
//!
//! Runs a registered model over a preprocessed tensor, decodes the top-k
//! predictions against the model's label set and optionally folds them into
//! coarse categories. A result whose best category is Human gets a second
//! pass through the specialized human model.

use std::path::PathBuf;
use std::sync::Arc;

use image::DynamicImage;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use strum::IntoStaticStr;

use crate::models::prediction::{
    finite_or_zero, AnalysisOutcome, CategoryScore, DecodedPrediction, Prediction,
};
use crate::services::categories::{self, CategoryTable};
use crate::services::preprocess::preprocess;
use crate::services::registry::{LabelCatalog, LabelIndex, LabelSet, ModelKind, ModelSpec};

/// Top-k used for the specialized human pass.
pub const HUMAN_PASS_TOP_K: usize = 10;

/// Prediction-log label of the specialized human score.
pub const HUMAN_SPECIALIZED: &str = "Human (specialized)";

#[derive(Debug, thiserror::Error, IntoStaticStr)]
pub enum InferenceError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model {model} produced {got} outputs, label set has {expected}")]
    ShapeMismatch {
        model: ModelKind,
        expected: usize,
        got: usize,
    },

    #[error("Inference failed: {0}")]
    Runtime(String),

    #[error("Preprocessing failed: {0}")]
    Preprocess(String),

    #[error("No labels loaded for {0}")]
    MissingLabels(LabelSet),
}

impl InferenceError {
    /// Category name recorded as a job's error kind.
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

/// Something that turns an input tensor into one probability per class.
pub trait ModelBackend: Send + Sync {
    fn predict(&self, spec: &ModelSpec, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError>;
}

/// ONNX Runtime backend. Sessions are built per call from the local
/// artifact and dropped once the output is copied out.
pub struct OnnxBackend {
    model_dir: PathBuf,
    intra_threads: usize,
}

impl OnnxBackend {
    pub fn new(model_dir: impl Into<PathBuf>, intra_threads: usize) -> Self {
        Self {
            model_dir: model_dir.into(),
            intra_threads,
        }
    }

    fn load(&self, spec: &ModelSpec) -> Result<Session, InferenceError> {
        let path = self.model_dir.join(spec.artifact);
        if !path.exists() {
            return Err(InferenceError::ModelLoad(format!(
                "model artifact not found: {}",
                path.display()
            )));
        }

        let load_err = |e: ort::Error| {
            InferenceError::ModelLoad(format!("{}: {}", path.display(), e))
        };

        Session::builder()
            .map_err(load_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_err)?
            .with_intra_threads(self.intra_threads)
            .map_err(load_err)?
            .commit_from_file(&path)
            .map_err(load_err)
    }
}

impl ModelBackend for OnnxBackend {
    fn predict(&self, spec: &ModelSpec, input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        let mut session = self.load(spec)?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| InferenceError::ModelLoad(format!("{} declares no inputs", spec.kind)))?;

        let runtime_err = |e: ort::Error| InferenceError::Runtime(e.to_string());

        let input_value = Value::from_array(input.to_owned()).map_err(runtime_err)?;
        let outputs = session
            .run(ort::inputs![input_name.as_str() => input_value])
            .map_err(runtime_err)?;

        let output = outputs[0]
            .try_extract_array::<f32>()
            .map_err(runtime_err)?;
        let probabilities: Vec<f32> = output.iter().copied().collect();

        tracing::debug!(model = %spec.kind, outputs = probabilities.len(), "Model run complete");
        Ok(probabilities)
    }
}

/// Result of one model pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub decoded: Vec<DecodedPrediction>,
    pub best_label: String,
    pub best_score: f64,
    pub category_ranking: Vec<CategoryScore>,
}

/// Top-`top_k` predictions, highest first. Ties keep index order and NaN
/// sorts below every number.
pub fn decode_top_k(probabilities: &[f32], labels: &LabelIndex, top_k: usize) -> Vec<DecodedPrediction> {
    let rank = |p: f32| if p.is_nan() { f32::NEG_INFINITY } else { p };

    let mut order: Vec<usize> = (0..probabilities.len()).collect();
    order.sort_by(|&a, &b| rank(probabilities[b]).total_cmp(&rank(probabilities[a])));

    order
        .into_iter()
        .take(top_k)
        .map(|index| DecodedPrediction {
            index,
            label: labels.label(index).to_string(),
            probability: probabilities[index],
        })
        .collect()
}

/// Append-only prediction list for one analysis run.
#[derive(Debug, Default)]
pub struct PredictionLog {
    entries: Vec<Prediction>,
}

impl PredictionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, prob: f64) -> &mut Self {
        self.entries.push(Prediction {
            label: label.into(),
            prob: finite_or_zero(prob),
        });
        self
    }

    pub fn extend_decoded(&mut self, decoded: &[DecodedPrediction]) -> &mut Self {
        for prediction in decoded {
            self.push(prediction.label.clone(), prediction.probability as f64);
        }
        self
    }

    /// One `"{rank} {category}"` entry per ranking position, 1-based.
    pub fn extend_ranking(&mut self, ranking: &[CategoryScore]) -> &mut Self {
        for (position, score) in ranking.iter().enumerate() {
            self.push(format!("{} {}", position + 1, score.category), score.score);
        }
        self
    }

    pub fn finish(self) -> Vec<Prediction> {
        self.entries
    }
}

pub struct InferenceEngine {
    labels: Arc<LabelCatalog>,
    categories: CategoryTable,
    backend: Arc<dyn ModelBackend>,
}

impl InferenceEngine {
    pub fn new(
        labels: Arc<LabelCatalog>,
        categories: CategoryTable,
        backend: Arc<dyn ModelBackend>,
    ) -> Self {
        Self {
            labels,
            categories,
            backend,
        }
    }

    /// One model pass over an already preprocessed tensor.
    pub fn run_inference(
        &self,
        kind: ModelKind,
        input: &Array4<f32>,
        use_category: bool,
        top_k: usize,
    ) -> Result<Classification, InferenceError> {
        let spec = kind.spec();
        let labels = self.labels.get(spec.labels)?;

        let probabilities = self.backend.predict(&spec, input)?;
        if probabilities.len() != labels.len() {
            return Err(InferenceError::ShapeMismatch {
                model: kind,
                expected: labels.len(),
                got: probabilities.len(),
            });
        }

        let decoded = decode_top_k(&probabilities, labels, top_k);

        let (best_label, best_score, category_ranking) = if use_category {
            let ranking = self.categories.aggregate(&decoded);
            let best = ranking
                .first()
                .map(|top| (top.category.to_string(), top.score))
                .ok_or_else(|| InferenceError::Runtime("category ranking is empty".to_string()))?;
            (best.0, best.1, ranking)
        } else {
            let top = decoded.first().ok_or_else(|| {
                InferenceError::Runtime(format!("{} produced no predictions", kind))
            })?;
            (top.label.clone(), top.probability as f64, Vec::new())
        };

        Ok(Classification {
            decoded,
            best_label,
            best_score,
            category_ranking,
        })
    }

    /// Full analysis of one decoded image: primary pass, prediction log and
    /// the specialized human pass when the primary pass lands on Human.
    pub fn analyze(
        &self,
        kind: ModelKind,
        image: &DynamicImage,
        use_category: bool,
        top_k: usize,
    ) -> Result<AnalysisOutcome, InferenceError> {
        let input = preprocess(image, kind.spec().preprocess)?;

        let primary = self.run_inference(kind, &input, use_category, top_k)?;

        let mut log = PredictionLog::new();
        log.extend_decoded(&primary.decoded)
            .extend_ranking(&primary.category_ranking);

        let mut best_score = primary.best_score;
        if primary.best_label == categories::HUMAN {
            let human = self.run_inference(ModelKind::HUMAN, &input, true, HUMAN_PASS_TOP_K)?;
            tracing::debug!(
                primary_score = primary.best_score,
                specialized_score = human.best_score,
                "Specialized human pass complete"
            );
            log.push(HUMAN_SPECIALIZED, human.best_score);
            if human.best_score > best_score {
                best_score = human.best_score;
            }
        }

        Ok(AnalysisOutcome {
            label: primary.best_label,
            best_score,
            top_predictions: log.finish(),
        })
    }
}

//! Model registry.
//!
//! A closed set of classification models, each resolved to the artifact it
//! loads from, the label set that decodes its output and the preprocessing
//! its input expects. Unknown model names resolve to the default model.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::services::inference::InferenceError;

/// Input edge length shared by every registered model.
pub const INPUT_SIZE: u32 = 224;

/// Known models, keyed by the name clients submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr)]
pub enum ModelKind {
    #[strum(serialize = "efficientnet_b0")]
    EfficientNetB0,
    #[strum(serialize = "mobilenet_v2")]
    MobileNetV2,
    #[strum(serialize = "resnet50")]
    ResNet50,
    /// EfficientNet-B0 fine-tuned on ImageNet plus a "person" class.
    #[strum(serialize = "effb0_1001human")]
    Effb0Human,
    #[strum(serialize = "effb0_5class")]
    Effb0FiveClass,
}

impl ModelKind {
    pub const DEFAULT: ModelKind = ModelKind::EfficientNetB0;

    /// Model used for the specialized pass on Human results.
    pub const HUMAN: ModelKind = ModelKind::Effb0Human;

    /// Resolve a submitted model name, falling back to the default model.
    pub fn resolve(name: &str) -> ModelKind {
        match ModelKind::from_str(name) {
            Ok(kind) => kind,
            Err(_) => {
                tracing::warn!(
                    model_name = %name,
                    fallback = %ModelKind::DEFAULT,
                    "Unknown model requested, using default"
                );
                ModelKind::DEFAULT
            }
        }
    }

    pub fn spec(self) -> ModelSpec {
        match self {
            ModelKind::EfficientNetB0 => ModelSpec {
                kind: self,
                artifact: "efficientnet_b0.onnx",
                labels: LabelSet::ImageNet,
                preprocess: Preprocess::PassThrough,
            },
            ModelKind::MobileNetV2 => ModelSpec {
                kind: self,
                artifact: "mobilenet_v2.onnx",
                labels: LabelSet::ImageNet,
                preprocess: Preprocess::Symmetric,
            },
            ModelKind::ResNet50 => ModelSpec {
                kind: self,
                artifact: "resnet50.onnx",
                labels: LabelSet::ImageNet,
                preprocess: Preprocess::Caffe,
            },
            ModelKind::Effb0Human => ModelSpec {
                kind: self,
                artifact: "effb0_1001human_model.onnx",
                labels: LabelSet::ImageNetHuman,
                preprocess: Preprocess::PassThrough,
            },
            ModelKind::Effb0FiveClass => ModelSpec {
                kind: self,
                artifact: "effb0_5class_model.onnx",
                labels: LabelSet::FiveClass,
                preprocess: Preprocess::PassThrough,
            },
        }
    }
}

/// How raw RGB pixels are turned into model input values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preprocess {
    /// Pixels stay in [0, 255]; the network rescales internally.
    PassThrough,
    /// Pixels scaled to [-1, 1].
    Symmetric,
    /// RGB -> BGR, ImageNet channel means subtracted, no scaling.
    Caffe,
}

/// Label space a model decodes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum LabelSet {
    ImageNet,
    ImageNetHuman,
    FiveClass,
}

impl LabelSet {
    pub fn artifact(self) -> &'static str {
        match self {
            LabelSet::ImageNet => "imagenet_class_index.json",
            LabelSet::ImageNetHuman => "imagenet_class_index_extended.json",
            LabelSet::FiveClass => "class_index_5class.json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub kind: ModelKind,
    /// Artifact file name, relative to the model directory.
    pub artifact: &'static str,
    pub labels: LabelSet,
    pub preprocess: Preprocess,
}

/// Every artifact the registry can ask for: model weights and label maps.
pub fn all_artifacts() -> Vec<&'static str> {
    ModelKind::iter()
        .map(|kind| kind.spec().artifact)
        .chain(LabelSet::iter().map(LabelSet::artifact))
        .collect()
}

/// Index → label map for one label set.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelIndex {
    labels: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LabelEntry {
    Name(String),
    /// Keras-style `[wnid, name]`.
    Keras(String, String),
}

impl LabelIndex {
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a `{"0": "label"}` or `{"0": ["wnid", "label"]}` class index.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let raw: HashMap<String, LabelEntry> = serde_json::from_str(json)?;

        let mut entries = Vec::with_capacity(raw.len());
        for (key, entry) in raw {
            let index: usize = key.trim().parse().map_err(|_| {
                <serde_json::Error as serde::de::Error>::custom(format!(
                    "class index key {:?} is not an integer",
                    key
                ))
            })?;
            if index >= MAX_CLASS_COUNT {
                return Err(<serde_json::Error as serde::de::Error>::custom(format!(
                    "class index {} exceeds the limit of {} classes",
                    index, MAX_CLASS_COUNT
                )));
            }
            let label = match entry {
                LabelEntry::Name(name) => name,
                LabelEntry::Keras(_, name) => name,
            };
            entries.push((index, label));
        }

        let len = entries.iter().map(|(i, _)| i + 1).max().unwrap_or(0);
        let mut labels = vec![UNKNOWN_LABEL.to_string(); len];
        for (index, label) in entries {
            labels[index] = label;
        }
        Ok(Self { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, index: usize) -> &str {
        self.labels
            .get(index)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_LABEL)
    }
}

pub const UNKNOWN_LABEL: &str = "Unknown";

/// Upper bound on class indices in a label file; gaps below it are filled
/// with [`UNKNOWN_LABEL`].
pub const MAX_CLASS_COUNT: usize = 65_536;

/// Read-only label maps, loaded once when a worker starts.
#[derive(Debug, Clone, Default)]
pub struct LabelCatalog {
    sets: HashMap<LabelSet, LabelIndex>,
}

impl LabelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, set: LabelSet, index: LabelIndex) -> Self {
        self.sets.insert(set, index);
        self
    }

    /// Load every label set from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, LabelLoadError> {
        let mut catalog = Self::new();
        for set in LabelSet::iter() {
            let path = model_dir.join(set.artifact());
            let json = std::fs::read_to_string(&path).map_err(|source| LabelLoadError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let index = LabelIndex::from_json(&json).map_err(|source| LabelLoadError::Parse {
                path: path.display().to_string(),
                source,
            })?;
            tracing::info!(label_set = %set, labels = index.len(), "Loaded label index");
            catalog = catalog.with(set, index);
        }
        Ok(catalog)
    }

    pub fn get(&self, set: LabelSet) -> Result<&LabelIndex, InferenceError> {
        self.sets.get(&set).ok_or(InferenceError::MissingLabels(set))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LabelLoadError {
    #[error("Failed to read label index {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse label index {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

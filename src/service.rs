use ndarray::Array4;

use crate::{
    classifier::{Classifier, TractClassifier},
    config::AppConfig,
    error::PredictError,
    labels::{softmax, LabelTable},
    models::Prediction,
    preprocess::PreProcessor,
};

/// Process-wide inference state, constructed once before the server starts
/// and shared read-only by every request.
pub struct InferenceService {
    classifier: Box<dyn Classifier>,
    labels: LabelTable,
    preprocessor: PreProcessor,
    apply_softmax: bool,
    top_k: usize,
}

impl InferenceService {
    pub fn new(
        classifier: Box<dyn Classifier>,
        labels: LabelTable,
        preprocessor: PreProcessor,
        config: &AppConfig,
    ) -> Self {
        Self {
            classifier,
            labels,
            preprocessor,
            apply_softmax: config.apply_softmax,
            top_k: config.top_k,
        }
    }

    /// Load the ONNX model and label table named by `config`.
    ///
    /// Both files must already be present locally.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let preprocessor =
            PreProcessor::new(config.input_size, config.input_layout, config.input_scaling);
        let classifier = TractClassifier::load(&config.model_path, preprocessor.input_shape())?;
        let labels = LabelTable::from_path(&config.labels_path)?;
        tracing::info!(classes = labels.len(), "Labels loaded");

        Ok(Self::new(Box::new(classifier), labels, preprocessor, config))
    }

    /// Run one blank input through the model and check that its output lines
    /// up with the label table.
    pub fn warm_up(&self) -> anyhow::Result<()> {
        let blank = Array4::zeros(self.preprocessor.input_shape());
        let scores = self.classifier.classify(&blank)?;
        anyhow::ensure!(
            scores.len() == self.labels.len(),
            "model produces {} class scores but {} labels are loaded",
            scores.len(),
            self.labels.len()
        );
        Ok(())
    }

    /// Classify an uploaded image and return its top predictions, highest
    /// probability first.
    pub fn predict(&self, bytes: &[u8]) -> Result<Vec<Prediction>, PredictError> {
        let input = {
            let _span = tracing::debug_span!("preprocess").entered();
            self.preprocessor.preprocess(bytes)?
        };

        let mut scores = {
            let _span = tracing::debug_span!("model_inference").entered();
            self.classifier
                .classify(&input)
                .map_err(PredictError::internal)?
        };

        if self.apply_softmax {
            softmax(&mut scores);
        }

        self.labels.decode_top_k(&scores, self.top_k)
    }
}

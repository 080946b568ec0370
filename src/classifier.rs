use std::path::Path;

use ndarray::Array4;
use tract_onnx::prelude::*;

/// A loaded image classification model.
///
/// Inference takes `&self` so a single instance can serve concurrent
/// requests without a lock.
pub trait Classifier: Send + Sync {
    /// Run a forward pass over a batch of one and return the per-class scores.
    fn classify(&self, input: &Array4<f32>) -> anyhow::Result<Vec<f32>>;
}

pub struct TractClassifier {
    model: TypedRunnableModel<TypedModel>,
    input_shape: [usize; 4],
}

impl TractClassifier {
    /// Load an ONNX model, pin its input to `input_shape`, optimize it and
    /// make it runnable.
    pub fn load(path: impl AsRef<Path>, input_shape: [usize; 4]) -> anyhow::Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), ?input_shape, "Loading ONNX model");

        let model = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(0, f32::fact(input_shape).into())?
            .into_optimized()?
            .into_runnable()?;

        Ok(Self { model, input_shape })
    }
}

impl Classifier for TractClassifier {
    fn classify(&self, input: &Array4<f32>) -> anyhow::Result<Vec<f32>> {
        anyhow::ensure!(
            input.shape() == &self.input_shape[..],
            "input tensor has shape {:?}, model expects {:?}",
            input.shape(),
            self.input_shape
        );

        let data = input
            .as_slice()
            .ok_or_else(|| anyhow::anyhow!("input tensor is not contiguous"))?;
        let tensor = Tensor::from_shape(&self.input_shape, data)?;

        let result = self.model.run(tvec!(tensor.into()))?;
        let scores = result
            .first()
            .ok_or_else(|| anyhow::anyhow!("model produced no outputs"))?
            .as_slice::<f32>()?
            .to_vec();

        Ok(scores)
    }
}

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;

use crate::error::PredictError;
use crate::models::Prediction;

/// Human-readable class names indexed by model output position.
#[derive(Debug, Clone)]
pub struct LabelTable {
    labels: Vec<String>,
}

impl LabelTable {
    /// Load a Keras style `imagenet_class_index.json` when the file ends in
    /// `.json`, otherwise a text file with one label per line.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read labels from {}", path.display()))?;

        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_class_index_json(&raw)
        } else {
            Ok(Self::from_lines(&raw))
        }
    }

    /// Parse `{"0": ["n01440764", "tench"], "1": [...], ...}`.
    pub fn from_class_index_json(raw: &str) -> anyhow::Result<Self> {
        let index: HashMap<String, (String, String)> =
            serde_json::from_str(raw).context("malformed class index json")?;

        let mut labels = vec![None; index.len()];
        for (key, (_wnid, name)) in index {
            let i: usize = key
                .parse()
                .with_context(|| format!("class index key {key:?} is not a number"))?;
            let slot = labels
                .get_mut(i)
                .with_context(|| format!("class index {i} is out of range"))?;
            *slot = Some(name);
        }

        let labels = labels
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .context("class index is not contiguous")?;
        Ok(Self { labels })
    }

    pub fn from_lines(raw: &str) -> Self {
        let labels = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        Self { labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Pair the `k` highest scores with their labels, highest first.
    pub fn decode_top_k(&self, scores: &[f32], k: usize) -> Result<Vec<Prediction>, PredictError> {
        if scores.len() != self.labels.len() {
            return Err(PredictError::InternalInferenceError(format!(
                "model produced {} class scores but {} labels are loaded",
                scores.len(),
                self.labels.len()
            )));
        }

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        Ok(order
            .into_iter()
            .take(k)
            .map(|i| Prediction {
                class_name: self.labels[i].clone(),
                probability: scores[i],
            })
            .collect())
    }
}

/// Turn raw logits into a probability distribution in place.
pub fn softmax(scores: &mut [f32]) {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    if sum > 0.0 {
        scores.iter_mut().for_each(|s| *s /= sum);
    }
}

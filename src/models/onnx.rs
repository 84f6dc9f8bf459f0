//! ONNX Runtime scorer for models exported from the training stack

use crate::models::scorer::Scorer;
use anyhow::{Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// ONNX session scoring one row at a time
pub struct OnnxScorer {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OnnxScorer {
    pub fn load(path: &Path) -> Result<Self> {
        ort::init().commit()?;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load ONNX model from {}", path.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "float_input".to_string());

        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob"))
            .or_else(|| session.outputs.last())
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "probabilities".to_string());

        info!(path = %path.display(), input = %input_name, output = %output_name, "ONNX scorer loaded");

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }

    /// Anomaly-class probability from a `[batch, classes]` or `[classes]` tensor
    fn anomaly_probability(shape: &ort::tensor::Shape, data: &[f32]) -> Option<f64> {
        let classes = shape.iter().last().copied().unwrap_or(0);
        match classes {
            c if c >= 2 => data.get(1).map(|&v| v as f64),
            1 => data.first().map(|&v| v as f64),
            _ => None,
        }
    }
}

impl Scorer for OnnxScorer {
    fn kind(&self) -> &'static str {
        "onnx"
    }

    fn score(&self, features: &[f64]) -> Result<f64> {
        let row: Vec<f32> = features.iter().map(|&v| v as f32).collect();
        let shape = vec![1_i64, row.len() as i64];
        let input = Tensor::from_array((shape, row)).context("Failed to create input tensor")?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![self.input_name.as_str() => input])?;
        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| anyhow::anyhow!("output {} missing", self.output_name))?;

        let (shape, data) = output.try_extract_tensor::<f32>()?;
        Self::anomaly_probability(shape, data)
            .ok_or_else(|| anyhow::anyhow!("output {} has no anomaly probability", self.output_name))
    }
}

impl fmt::Debug for OnnxScorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxScorer")
            .field("input_name", &self.input_name)
            .field("output_name", &self.output_name)
            .finish()
    }
}

//! Scoring engine holding the current model behind an atomic pointer

use crate::error::PipelineResult;
use crate::feature_extractor::FeatureSchema;
use crate::models::loader::ModelLoader;
use crate::models::scorer::ScoringModel;
use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Serves the current [`ScoringModel`].
///
/// Readers take a snapshot with a single atomic load and keep scoring
/// against it even if a reload publishes a newer model meanwhile. Only
/// swaps are serialized.
pub struct ScoringEngine {
    current: ArcSwap<ScoringModel>,
    loader: ModelLoader,
    swap_lock: Mutex<()>,
}

impl ScoringEngine {
    /// Serve an already-validated model
    pub fn new(model: ScoringModel, loader: ModelLoader) -> Self {
        Self {
            current: ArcSwap::from_pointee(model),
            loader,
            swap_lock: Mutex::new(()),
        }
    }

    /// Load the artifact at `path`, failing fast on any schema or artifact error
    pub fn load<P: AsRef<Path>>(path: P, expected: Arc<FeatureSchema>) -> PipelineResult<Self> {
        let loader = ModelLoader::new(expected);
        let model = loader.load(path)?;
        Ok(Self::new(model, loader))
    }

    /// Consistent view of the model for one scoring call
    pub fn snapshot(&self) -> Arc<ScoringModel> {
        self.current.load_full()
    }

    pub fn version(&self) -> String {
        self.current.load().version().to_string()
    }

    /// Publish `model` and return the one it replaced
    pub fn swap(&self, model: ScoringModel) -> Arc<ScoringModel> {
        let _guard = self.swap_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.current.swap(Arc::new(model));
        info!(
            from = %previous.version(),
            to = %self.current.load().version(),
            "Scoring model swapped"
        );
        previous
    }

    /// Load a new artifact and swap it in; the current model keeps serving on error
    pub fn reload_from<P: AsRef<Path>>(&self, path: P) -> PipelineResult<Arc<ScoringModel>> {
        let model = self.loader.load(path)?;
        self.swap(model);
        Ok(self.snapshot())
    }
}

use std::sync::{Mutex, MutexGuard};

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::{
    embedding::Embedder,
    error::{Error, Result},
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "CHAPTERINDEX_MODEL";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Owns the ColBERT model and turns its token-level output into one
/// fixed-length vector per text (mean over its token embeddings, then L2
/// normalization). Each text is encoded alone, so there is no padding to
/// mask out.
///
/// The model is loaded lazily on the first embedding call and lives as long
/// as the manager; construct one at startup and share it by reference.
pub struct ModelManager {
    model: Mutex<Option<ColBERT>>,
    model_id: String,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelManager {
    /// Creates a new `ModelManager`. The model ID is resolved from:
    /// 1. The `CHAPTERINDEX_MODEL` environment variable, if set
    /// 2. Otherwise, the default model (`lightonai/GTE-ModernColBERT-v1`)
    pub fn new() -> Self {
        let model_id = std::env::var(MODEL_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string());
        Self::with_model_id(model_id)
    }

    /// Creates a `ModelManager` with an explicit model ID, bypassing
    /// environment variable resolution.
    pub fn with_model_id(model_id: String) -> Self {
        Self {
            model: Mutex::new(None),
            model_id,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<ColBERT>>> {
        self.model.lock().map_err(|_| {
            Error::EmbeddingFailure("model lock poisoned".to_string())
        })
    }

    /// Encode one document into its pooled embedding.
    fn encode_pooled(&self, text: &str) -> Result<Vec<f32>> {
        let mut guard = self.lock()?;
        if guard.is_none() {
            tracing::info!(model = %self.model_id, "loading embedding model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()
                .map_err(model_err)?;
            *guard = Some(colbert);
        }
        let Some(model) = guard.as_mut() else {
            return Err(Error::EmbeddingFailure("model not loaded".into()));
        };

        // [1, T, D] -> [T, D]
        let tokens = model
            .encode(&[text.to_string()], false)
            .map_err(model_err)?
            .squeeze(0)
            .map_err(model_err)?;
        pool(&tokens)
    }
}

/// Mean over the token axis, then scale to unit length.
fn pool(tokens: &Tensor) -> Result<Vec<f32>> {
    let mean = tokens.mean(0).map_err(model_err)?;
    let norm = mean
        .sqr()
        .and_then(|t| t.sum_all())
        .and_then(|t| t.sqrt())
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(model_err)?;

    let mut pooled = mean.to_vec1::<f32>().map_err(model_err)?;
    if norm > 0.0 {
        for v in &mut pooled {
            *v /= norm;
        }
    }
    Ok(pooled)
}

fn model_err(e: impl std::fmt::Display) -> Error {
    Error::EmbeddingFailure(format!("model error: {e}"))
}

impl Embedder for ModelManager {
    fn model_name(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.encode_pooled(text)
    }
}

use crate::error::{Error, Result};

/// Dimension used when no model dictates one (MiniLM-sized vectors).
pub const DEFAULT_DIMENSION: usize = 384;

/// A text -> vector function producing fixed-length embeddings.
///
/// Implementations must be deterministic for identical input and model
/// version. Errors are hard failures; callers never substitute a fallback
/// vector.
pub trait Embedder: Send + Sync {
    /// Identifier of the model, recorded next to every index built with it.
    fn model_name(&self) -> &str;

    /// Output dimension, if known before the first call.
    fn dimension(&self) -> Option<usize>;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// Any `Fn(&str) -> Result<Vec<f32>>` can stand in for a model.
impl<F> Embedder for F
where
    F: Fn(&str) -> Result<Vec<f32>> + Send + Sync,
{
    fn model_name(&self) -> &str {
        "custom"
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self(text)
    }
}

/// Normalize any provider error into [`Error::EmbeddingFailure`], keeping
/// shape errors intact so they surface as `DimensionMismatch`.
pub(crate) fn as_embedding_failure(err: Error, context: &str) -> Error {
    match err {
        Error::EmbeddingFailure(_) | Error::DimensionMismatch { .. } => err,
        other => Error::EmbeddingFailure(format!("{context}: {other}")),
    }
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub(crate) fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

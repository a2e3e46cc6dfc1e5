use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    chapter_store::{Chapter, ChapterRecord, truncate_chars},
    embedding::{Embedder, as_embedding_failure},
    error::{Error, Result},
    index_manager::{BuildSummary, IndexManager, LoadedIndex},
    textbook_id::TextbookId,
    vector_index::Neighbor,
};

/// Number of chapters returned when the caller does not ask for a count.
pub const DEFAULT_TOP_K: usize = 3;

/// Characters of the chapter excerpt shown in a result preview.
pub const PREVIEW_CHARS: usize = 300;

/// Map a squared L2 distance to a 0-100 score, higher meaning closer.
///
/// ```
/// use chapterindex::search::similarity_score;
///
/// assert_eq!(similarity_score(0.0), 100.0);
/// assert_eq!(similarity_score(2.5), 75.0);
/// assert_eq!(similarity_score(42.0), 0.0);
/// ```
pub fn similarity_score(distance: f32) -> f32 {
    if distance.is_nan() {
        return 0.0;
    }
    (100.0 - distance * 10.0).clamp(0.0, 100.0)
}

/// Coarse label for a similarity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Relevance {
    HighlyRelevant,
    Relevant,
    SomewhatRelevant,
    NotVeryRelevant,
}

impl Relevance {
    pub fn from_score(score: f32) -> Self {
        if score >= 90.0 {
            Relevance::HighlyRelevant
        } else if score >= 70.0 {
            Relevance::Relevant
        } else if score >= 50.0 {
            Relevance::SomewhatRelevant
        } else {
            Relevance::NotVeryRelevant
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Relevance::HighlyRelevant => "highly relevant",
            Relevance::Relevant => "relevant",
            Relevance::SomewhatRelevant => "somewhat relevant",
            Relevance::NotVeryRelevant => "not very relevant",
        }
    }
}

/// A chapter returned for a query, with its position in the ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChapterMatch {
    /// 1-based position in the result list.
    pub rank: usize,
    pub chapter: ChapterRecord,
    pub distance: f32,
    pub similarity_score: f32,
}

impl ChapterMatch {
    /// Inclusive page span, e.g. "Pages 12-30".
    pub fn page_range(&self) -> String {
        format!("Pages {}-{}", self.chapter.page_start, self.chapter.page_end)
    }

    /// Start of the chapter excerpt, ending in "..." when shortened.
    pub fn preview(&self) -> String {
        let excerpt = self.chapter.excerpt.trim();
        let head = truncate_chars(excerpt, PREVIEW_CHARS);
        if head.len() < excerpt.len() {
            format!("{head}...")
        } else {
            head.to_string()
        }
    }

    pub fn relevance(&self) -> Relevance {
        Relevance::from_score(self.similarity_score)
    }
}

/// A question to place in a textbook.
///
/// The id is opaque and echoed back unchanged; callers commonly use either
/// numbers or strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Question {
    pub id: serde_json::Value,
    pub text: String,
}

impl Question {
    pub fn new(id: impl Into<serde_json::Value>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Closest chapters for one question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionMapping {
    pub question_id: serde_json::Value,
    pub question: String,
    pub chapters: Vec<ChapterMatch>,
}

/// Answers queries against published chapter indexes.
///
/// Loaded indexes are cached per textbook and reused for as long as their
/// generation stays published. Generation names are never reused, even
/// after a delete, so rebuilds from other handles are always observed.
pub struct ChapterSearch {
    manager: Arc<IndexManager>,
    embedder: Arc<dyn Embedder>,
    cache: RwLock<HashMap<TextbookId, Arc<LoadedIndex>>>,
}

impl std::fmt::Debug for ChapterSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChapterSearch")
            .field("model", &self.embedder.model_name())
            .finish_non_exhaustive()
    }
}

impl ChapterSearch {
    pub fn new(manager: Arc<IndexManager>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            manager,
            embedder,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &IndexManager {
        &self.manager
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// Build or rebuild `id` with this service's embedder.
    pub fn build(
        &self,
        id: &TextbookId,
        chapters: &[Chapter],
    ) -> Result<BuildSummary> {
        let summary =
            self.manager
                .build_or_rebuild(id, chapters, self.embedder.as_ref())?;
        self.invalidate(id);
        Ok(summary)
    }

    /// Delete `id` and forget any cached copy.
    pub fn delete(&self, id: &TextbookId) -> Result<bool> {
        let removed = self.manager.delete(id)?;
        self.invalidate(id);
        Ok(removed)
    }

    /// Drop the cached index for `id`, if any.
    pub fn invalidate(&self, id: &TextbookId) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// The published index for `id`, from cache when still current.
    pub fn loaded(&self, id: &TextbookId) -> Result<Arc<LoadedIndex>> {
        let generation = match self.manager.current_generation(id) {
            Ok(generation) => generation,
            Err(e) => {
                self.invalidate(id);
                return Err(e);
            }
        };

        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .filter(|loaded| loaded.generation == generation)
        {
            return Ok(Arc::clone(hit));
        }

        let loaded = Arc::new(self.manager.load(id)?);
        if loaded.model != self.embedder.model_name() {
            tracing::warn!(
                textbook = %id,
                index_model = %loaded.model,
                query_model = %self.embedder.model_name(),
                "index was built with a different embedding model"
            );
        }
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::clone(&loaded));
        Ok(loaded)
    }

    /// The `top_k` chapters of `id` closest to `query`, closest first.
    pub fn search_chapters(
        &self,
        id: &TextbookId,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ChapterMatch>> {
        if top_k == 0 {
            return Err(Error::InvalidTopK);
        }
        let loaded = self.loaded(id)?;

        let vector = self
            .embedder
            .embed(query)
            .map_err(|e| as_embedding_failure(e, "query"))?;
        let hits = loaded.index.search(&vector, top_k)?;

        tracing::debug!(textbook = %id, hits = hits.len(), "searched chapters");
        to_matches(&loaded, &hits)
    }

    /// Run [`search_chapters`](Self::search_chapters) for every question,
    /// embedding them as one batch. Output order matches input order.
    pub fn map_questions_to_chapters(
        &self,
        id: &TextbookId,
        questions: &[Question],
        top_k: usize,
    ) -> Result<Vec<QuestionMapping>> {
        if top_k == 0 {
            return Err(Error::InvalidTopK);
        }
        let loaded = self.loaded(id)?;
        if questions.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> =
            questions.iter().map(|q| q.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .map_err(|e| as_embedding_failure(e, "questions"))?;
        if vectors.len() != texts.len() {
            return Err(Error::EmbeddingFailure(format!(
                "provider returned {} vectors for {} questions",
                vectors.len(),
                texts.len()
            )));
        }

        let hits = loaded.index.search_batch(&vectors, top_k)?;
        tracing::debug!(
            textbook = %id,
            questions = questions.len(),
            "mapped questions to chapters"
        );

        questions
            .iter()
            .zip(hits)
            .map(|(question, hits)| {
                Ok(QuestionMapping {
                    question_id: question.id.clone(),
                    question: question.text.clone(),
                    chapters: to_matches(&loaded, &hits)?,
                })
            })
            .collect()
    }
}

fn to_matches(
    loaded: &LoadedIndex,
    hits: &[Neighbor],
) -> Result<Vec<ChapterMatch>> {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| {
            Ok(ChapterMatch {
                rank: i + 1,
                chapter: loaded.chapters.get(hit.row_id)?.clone(),
                distance: hit.distance,
                similarity_score: similarity_score(hit.distance),
            })
        })
        .collect()
}

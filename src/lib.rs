//! chapterindex - semantic question-to-chapter mapping for textbooks.
//!
//! Each textbook gets its own exact nearest-neighbor index over one embedding
//! per chapter. Questions are embedded with the same model and matched to the
//! closest chapters, scored on a 0-100 scale.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chapterindex::{
//!     Chapter, ChapterSearch, DataDir, IndexManager, TextbookId,
//!     TrigramEmbedder,
//! };
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let manager = Arc::new(IndexManager::open(data_dir).unwrap());
//! let search = ChapterSearch::new(manager, Arc::new(TrigramEmbedder::default()));
//!
//! let id = TextbookId::from(42);
//! search
//!     .build(&id, &[Chapter {
//!         number: Some(1),
//!         title: "Kinematics".to_string(),
//!         page_start: 1,
//!         page_end: 24,
//!         content: "Displacement, velocity and acceleration.".to_string(),
//!     }])
//!     .unwrap();
//!
//! for m in search.search_chapters(&id, "what is velocity?", 3).unwrap() {
//!     println!("{} {} ({:.1})", m.rank, m.chapter.title, m.similarity_score);
//! }
//! ```

pub mod chapter_store;
pub mod cli;
pub mod data_dir;
pub mod embedding;
pub mod embedding_db;
pub mod error;
pub mod index_manager;
pub mod mcp;
pub mod model_manager;
pub mod search;
pub mod textbook_id;
pub mod trigram;
pub mod vector_index;

pub use chapter_store::{Chapter, ChapterRecord, ChapterStore};
pub use data_dir::DataDir;
pub use embedding::Embedder;
pub use embedding_db::EmbeddingDb;
pub use error::{Error, Result};
pub use index_manager::{
    AbortHandle,
    BuildSummary,
    HealthReport,
    IndexManager,
    LoadedIndex,
};
pub use model_manager::ModelManager;
pub use search::{ChapterMatch, ChapterSearch, Question, QuestionMapping};
pub use textbook_id::TextbookId;
pub use trigram::TrigramEmbedder;
pub use vector_index::{Neighbor, VectorIndex};

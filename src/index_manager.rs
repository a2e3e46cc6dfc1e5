//! Lifecycle of per-textbook chapter indexes on disk.
//!
//! Every successful build produces an immutable *generation* directory
//! (`gen-000001-<nonce>`, `gen-000002-<nonce>`, ...) holding the vector
//! index, the chapter metadata and a raw-embeddings backup. A textbook's `CURRENT` file names
//! the published generation and is only ever replaced by an atomic rename,
//! so readers see either the old or the new index and never a mix of both.
//!
//! Builds happen in `<data_dir>/staging` and are moved into place only after
//! the staged files have been read back and cross-checked. A failed, aborted
//! or crashed build therefore leaves the previously published generation
//! untouched.

use std::{
    collections::HashSet,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::{
    chapter_store::{Chapter, ChapterStore},
    data_dir::DataDir,
    embedding::{Embedder, as_embedding_failure},
    embedding_db::EmbeddingDb,
    error::{Error, Result},
    textbook_id::TextbookId,
    vector_index::VectorIndex,
};

pub const CURRENT_FILE: &str = "CURRENT";
pub const VECTORS_FILE: &str = "vectors.bin";
pub const CHAPTERS_FILE: &str = "chapters.json";
pub const EMBEDDINGS_FILE: &str = "embeddings.redb";

const GENERATION_PREFIX: &str = "gen-";

/// How often a load restarts when a concurrent rebuild retires the
/// generation it was reading.
const LOAD_ATTEMPTS: usize = 5;

/// Cooperative cancellation for a running build.
///
/// Clones share the same flag. Aborting before the build publishes discards
/// everything it staged.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub textbook_id: String,
    pub chapter_count: usize,
    pub dimension: usize,
    pub generation: String,
    pub model: String,
}

/// A fully validated index and its chapters, as published by one build.
#[derive(Debug)]
pub struct LoadedIndex {
    pub textbook_id: TextbookId,
    pub generation: String,
    /// Embedding model the index was built with.
    pub model: String,
    pub index: VectorIndex,
    pub chapters: ChapterStore,
}

/// Read-only view of an index's on-disk state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub textbook_id: String,
    pub generation: Option<String>,
    pub vector_count: usize,
    pub chapter_count: usize,
    pub dimension: Option<usize>,
    /// Entries in the raw-embeddings backup, when one is present.
    pub backup_count: Option<u64>,
    pub ok: bool,
    pub problem: Option<String>,
}

struct Snapshot {
    index: VectorIndex,
    chapters: ChapterStore,
    model: String,
}

/// Owns the `textbooks/` and `staging/` directories of a [`DataDir`].
///
/// A data directory must be managed by a single process at a time.
#[derive(Debug)]
pub struct IndexManager {
    data_dir: DataDir,
    textbooks: PathBuf,
    staging: PathBuf,
    in_flight: Mutex<HashSet<TextbookId>>,
}

/// Marks a textbook as busy until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<TextbookId>>,
    id: TextbookId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl IndexManager {
    /// Prepare the working directories and discard builds left behind by a
    /// crashed process.
    pub fn open(data_dir: DataDir) -> Result<Self> {
        let textbooks = data_dir.textbooks_dir()?;
        let staging = data_dir.staging_dir()?;

        for entry in std::fs::read_dir(&staging)? {
            let path = entry?.path();
            tracing::warn!(path = %path.display(), "removing stale staging directory");
            if let Err(e) = remove_path(&path) {
                tracing::warn!(path = %path.display(), "could not remove stale staging entry: {e}");
            }
        }

        Ok(Self {
            data_dir,
            textbooks,
            staging,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    fn claim(&self, id: &TextbookId) -> Result<InFlight<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !set.insert(id.clone()) {
            return Err(Error::RebuildInProgress(id.to_string()));
        }
        Ok(InFlight {
            set: &self.in_flight,
            id: id.clone(),
        })
    }

    /// Embed, build and publish a new index for `id`, replacing any previous
    /// one.
    pub fn build_or_rebuild(
        &self,
        id: &TextbookId,
        chapters: &[Chapter],
        embedder: &dyn Embedder,
    ) -> Result<BuildSummary> {
        self.build_with_abort(id, chapters, embedder, &AbortHandle::new())
    }

    /// Same as [`build_or_rebuild`](Self::build_or_rebuild), checking
    /// `abort` between chapters and right before publishing.
    pub fn build_with_abort(
        &self,
        id: &TextbookId,
        chapters: &[Chapter],
        embedder: &dyn Embedder,
        abort: &AbortHandle,
    ) -> Result<BuildSummary> {
        if chapters.is_empty() {
            return Err(Error::EmptyInput);
        }
        for (position, chapter) in chapters.iter().enumerate() {
            chapter.validate(position)?;
        }

        let _busy = self.claim(id)?;
        tracing::info!(
            textbook = %id,
            chapters = chapters.len(),
            model = embedder.model_name(),
            "building chapter index"
        );

        let mut vectors = Vec::with_capacity(chapters.len());
        for (position, chapter) in chapters.iter().enumerate() {
            ensure_not_aborted(abort, id)?;

            let text = if chapter.content.trim().is_empty() {
                &chapter.title
            } else {
                &chapter.content
            };
            let vector = embedder.embed(text).map_err(|e| {
                as_embedding_failure(
                    e,
                    &format!("chapter {position} ('{}')", chapter.title),
                )
            })?;
            if let Some(expected) = embedder.dimension()
                && vector.len() != expected
            {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
            vectors.push(vector);
        }

        let index = VectorIndex::build(&vectors)?;
        let store = ChapterStore::attach(chapters)?;
        let model = embedder.model_name().to_string();

        let staging = tempfile::Builder::new()
            .prefix(&format!("{id}-"))
            .tempdir_in(&self.staging)?;
        index.write_to(&staging.path().join(VECTORS_FILE))?;
        store.write_to(
            &staging.path().join(CHAPTERS_FILE),
            id.as_str(),
            &model,
            index.dimension(),
        )?;
        EmbeddingDb::open(&staging.path().join(EMBEDDINGS_FILE))?
            .store_all(&vectors)?;

        // Publish only what reads back identically.
        let staged = read_snapshot(staging.path(), id)?;
        if staged.index != index || staged.chapters != store {
            return Err(Error::CorruptIndex {
                textbook_id: id.to_string(),
                reason: "staged files do not match the built index".into(),
            });
        }

        ensure_not_aborted(abort, id)?;
        let generation = self.publish(id, staging)?;

        tracing::info!(
            textbook = %id,
            generation = %generation,
            chapters = store.len(),
            dimension = index.dimension(),
            "published chapter index"
        );

        Ok(BuildSummary {
            textbook_id: id.to_string(),
            chapter_count: store.len(),
            dimension: index.dimension(),
            generation,
            model,
        })
    }

    fn publish(
        &self,
        id: &TextbookId,
        staging: tempfile::TempDir,
    ) -> Result<String> {
        let textbook_dir = self.data_dir.textbook_dir(id);
        std::fs::create_dir_all(&textbook_dir)?;

        let previous = read_pointer(&textbook_dir, id)?;
        let generation = next_generation(&textbook_dir)?;
        let target = textbook_dir.join(&generation);

        std::fs::rename(staging.path(), &target)?;
        let _ = staging.keep();

        if let Err(e) = write_pointer(&textbook_dir, &generation) {
            // Unreferenced generations are pruned by the next publish.
            let _ = std::fs::remove_dir_all(&target);
            return Err(e);
        }

        prune_generations(&textbook_dir, &generation, previous.as_deref());
        Ok(generation)
    }

    /// Name of the generation currently published for `id`.
    pub fn current_generation(&self, id: &TextbookId) -> Result<String> {
        read_pointer(&self.data_dir.textbook_dir(id), id)?
            .ok_or_else(|| Error::IndexNotFound(id.to_string()))
    }

    /// Load the published index and chapter metadata for `id`.
    pub fn load(&self, id: &TextbookId) -> Result<LoadedIndex> {
        let textbook_dir = self.data_dir.textbook_dir(id);

        for attempt in 1..=LOAD_ATTEMPTS {
            let generation = self.current_generation(id)?;
            let err = match read_snapshot(&textbook_dir.join(&generation), id) {
                Ok(snapshot) => {
                    tracing::debug!(textbook = %id, generation = %generation, "loaded chapter index");
                    return Ok(LoadedIndex {
                        textbook_id: id.clone(),
                        generation,
                        model: snapshot.model,
                        index: snapshot.index,
                        chapters: snapshot.chapters,
                    });
                }
                Err(err) => err,
            };

            match self.current_generation(id) {
                Err(gone @ Error::IndexNotFound(_)) => return Err(gone),
                Ok(now) if now != generation && attempt < LOAD_ATTEMPTS => {
                    tracing::debug!(
                        textbook = %id,
                        from = %generation,
                        to = %now,
                        "generation replaced during load, retrying"
                    );
                }
                _ => return Err(as_corrupt(err, id, &generation)),
            }
        }

        Err(Error::CorruptIndex {
            textbook_id: id.to_string(),
            reason: "published generation kept changing during load".into(),
        })
    }

    /// Inspect the published index without failing on inconsistencies.
    pub fn health_check(&self, id: &TextbookId) -> HealthReport {
        let mut report = HealthReport {
            textbook_id: id.to_string(),
            generation: None,
            vector_count: 0,
            chapter_count: 0,
            dimension: None,
            backup_count: None,
            ok: false,
            problem: None,
        };

        let generation = match self.current_generation(id) {
            Ok(generation) => generation,
            Err(e) => {
                report.problem = Some(e.to_string());
                return report;
            }
        };
        let dir = self.data_dir.textbook_dir(id).join(&generation);
        report.generation = Some(generation);

        let mut problems = Vec::new();
        let index =
            match VectorIndex::read_from(&dir.join(VECTORS_FILE), id.as_str()) {
                Ok(index) => {
                    report.vector_count = index.len();
                    report.dimension = Some(index.dimension());
                    Some(index)
                }
                Err(e) => {
                    problems.push(format!("vector index: {e}"));
                    None
                }
            };
        match ChapterStore::read_from(&dir.join(CHAPTERS_FILE), id.as_str()) {
            Ok((store, header)) => {
                report.chapter_count = store.len();
                if let Some(dimension) = report.dimension
                    && header.dimension != dimension
                {
                    problems.push(format!(
                        "metadata records dimension {} but index has {dimension}",
                        header.dimension
                    ));
                }
            }
            Err(e) => problems.push(format!("chapter metadata: {e}")),
        }
        if report.vector_count != report.chapter_count {
            problems.push(format!(
                "vector count {} does not match chapter count {}",
                report.vector_count, report.chapter_count
            ));
        }

        let backup = dir.join(EMBEDDINGS_FILE);
        if backup.exists() {
            match check_backup(&backup, index.as_ref()) {
                Ok((count, mismatch)) => {
                    report.backup_count = Some(count);
                    problems.extend(mismatch);
                }
                Err(e) => problems.push(format!("embeddings backup: {e}")),
            }
        }

        report.ok = problems.is_empty();
        if !problems.is_empty() {
            report.problem = Some(problems.join("; "));
        }
        report
    }

    /// Remove everything stored for `id`. Returns whether anything existed.
    ///
    /// The textbook directory is first moved into `staging/` in one rename,
    /// so a concurrent [`load`](Self::load) sees either the whole index or
    /// none of it.
    pub fn delete(&self, id: &TextbookId) -> Result<bool> {
        let _busy = self.claim(id)?;
        let dir = self.data_dir.textbook_dir(id);

        let trash = tempfile::Builder::new()
            .prefix(&format!("deleted-{id}-"))
            .tempdir_in(&self.staging)?;
        match std::fs::rename(&dir, trash.path().join(id.as_str())) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = trash.close() {
            tracing::warn!(textbook = %id, "could not remove deleted index: {e}");
        }
        tracing::info!(textbook = %id, "deleted chapter index");
        Ok(true)
    }

    /// Textbooks that currently have a published index, sorted by id.
    pub fn list(&self) -> Result<Vec<TextbookId>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.textbooks)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string)
            else {
                continue;
            };
            if let Ok(id) = TextbookId::new(name)
                && entry.path().join(CURRENT_FILE).is_file()
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Count the backup rows and list every row that disagrees with `index`.
fn check_backup(
    path: &Path,
    index: Option<&VectorIndex>,
) -> Result<(u64, Vec<String>)> {
    let db = EmbeddingDb::open_existing(path)?;
    let count = db.count()?;
    let Some(index) = index else {
        return Ok((count, Vec::new()));
    };

    let mut problems = Vec::new();
    if usize::try_from(count).ok() != Some(index.len()) {
        problems.push(format!(
            "backup holds {count} vectors but index has {}",
            index.len()
        ));
    }
    for (row_id, stored) in db.load_all()? {
        let row = usize::try_from(row_id).unwrap_or(usize::MAX);
        match index.vector(row) {
            Ok(indexed) if indexed == stored.as_slice() => {}
            Ok(_) => problems.push(format!(
                "backup vector for row {row_id} differs from the index"
            )),
            Err(_) => problems.push(format!(
                "backup has row {row_id} which the index lacks"
            )),
        }
    }
    Ok((count, problems))
}

fn ensure_not_aborted(abort: &AbortHandle, id: &TextbookId) -> Result<()> {
    if abort.is_aborted() {
        tracing::info!(textbook = %id, "build aborted");
        return Err(Error::BuildAborted(id.to_string()));
    }
    Ok(())
}

fn read_snapshot(dir: &Path, id: &TextbookId) -> Result<Snapshot> {
    let index = VectorIndex::read_from(&dir.join(VECTORS_FILE), id.as_str())?;
    let (chapters, header) =
        ChapterStore::read_from(&dir.join(CHAPTERS_FILE), id.as_str())?;

    if index.len() != chapters.len() {
        return Err(Error::CorruptIndex {
            textbook_id: id.to_string(),
            reason: format!(
                "vector count {} does not match chapter count {}",
                index.len(),
                chapters.len()
            ),
        });
    }
    if header.dimension != index.dimension() {
        return Err(Error::CorruptIndex {
            textbook_id: id.to_string(),
            reason: format!(
                "metadata records dimension {} but index has {}",
                header.dimension,
                index.dimension()
            ),
        });
    }

    Ok(Snapshot {
        index,
        chapters,
        model: header.model,
    })
}

fn as_corrupt(err: Error, id: &TextbookId, generation: &str) -> Error {
    match err {
        Error::Io(e) => Error::CorruptIndex {
            textbook_id: id.to_string(),
            reason: format!("generation {generation} is unreadable: {e}"),
        },
        other => other,
    }
}

/// Sequence number of a generation directory name such as
/// `gen-000002-17f3a9c04d21b6e8`.
fn parse_generation(name: &str) -> Option<u64> {
    let (seq, nonce) = name.strip_prefix(GENERATION_PREFIX)?.split_once('-')?;
    if nonce.is_empty() || !nonce.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    seq.parse().ok()
}

fn read_pointer(textbook_dir: &Path, id: &TextbookId) -> Result<Option<String>> {
    let raw = match std::fs::read_to_string(textbook_dir.join(CURRENT_FILE)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let generation = raw.trim();
    if parse_generation(generation).is_none() {
        return Err(Error::CorruptIndex {
            textbook_id: id.to_string(),
            reason: format!("{CURRENT_FILE} names invalid generation '{generation}'"),
        });
    }
    Ok(Some(generation.to_string()))
}

/// Atomically point `CURRENT` at `generation`.
fn write_pointer(textbook_dir: &Path, generation: &str) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(textbook_dir)?;
    writeln!(tmp, "{generation}")?;
    tmp.as_file().sync_all()?;
    tmp.persist(textbook_dir.join(CURRENT_FILE))
        .map_err(|e| e.error)?;

    // Make the rename durable where directories can be synced.
    if let Ok(dir) = std::fs::File::open(textbook_dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn generations(textbook_dir: &Path) -> Result<Vec<(u64, String)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(textbook_dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str()
            && let Some(n) = parse_generation(name)
        {
            found.push((n, name.to_string()));
        }
    }
    Ok(found)
}

/// The sequence number restarts once a textbook is deleted, so the name also
/// carries the publish time. A name is never reused for different contents.
fn next_generation(textbook_dir: &Path) -> Result<String> {
    let next = generations(textbook_dir)?
        .iter()
        .map(|(n, _)| n + 1)
        .max()
        .unwrap_or(1);
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    Ok(format!("{GENERATION_PREFIX}{next:06}-{nonce:016x}"))
}

/// Remove every generation except the published one and the one it
/// replaced; readers that resolved the previous pointer can still finish.
fn prune_generations(textbook_dir: &Path, current: &str, previous: Option<&str>) {
    let found = match generations(textbook_dir) {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(dir = %textbook_dir.display(), "could not list generations: {e}");
            return;
        }
    };

    for (_, name) in found {
        if name == current || Some(name.as_str()) == previous {
            continue;
        }
        let path = textbook_dir.join(&name);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "pruned generation"),
            Err(e) => tracing::warn!(path = %path.display(), "could not prune generation: {e}"),
        }
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::trigram::TrigramEmbedder;

    fn manager() -> (tempfile::TempDir, IndexManager) {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        (tmp, IndexManager::open(data_dir).unwrap())
    }

    fn chapter(title: &str, content: &str) -> Chapter {
        Chapter {
            number: None,
            title: title.to_string(),
            page_start: 1,
            page_end: 10,
            content: content.to_string(),
        }
    }

    fn toy_chapters() -> Vec<Chapter> {
        vec![
            chapter("Alpha", "alpha"),
            chapter("Beta", "beta"),
            chapter("Gamma", "gamma"),
        ]
    }

    /// Embeds the toy chapters as `[1,0]`, `[0,1]`, `[0.9,0.1]`.
    fn toy_embed(text: &str) -> Result<Vec<f32>> {
        Ok(match text {
            "alpha" => vec![1.0, 0.0],
            "beta" => vec![0.0, 1.0],
            "gamma" => vec![0.9, 0.1],
            _ => vec![0.5, 0.5],
        })
    }

    fn id(raw: &str) -> TextbookId {
        TextbookId::new(raw).unwrap()
    }

    #[test]
    fn build_then_load() {
        let (_tmp, manager) = manager();
        let summary = manager
            .build_or_rebuild(&id("7"), &toy_chapters(), &toy_embed)
            .unwrap();

        assert_eq!(summary.chapter_count, 3);
        assert_eq!(summary.dimension, 2);
        assert_eq!(parse_generation(&summary.generation), Some(1));
        assert_eq!(summary.model, "custom");

        let loaded = manager.load(&id("7")).unwrap();
        assert_eq!(loaded.index.len(), 3);
        assert_eq!(loaded.chapters.get(2).unwrap().title, "Gamma");
        let hits = loaded.index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].row_id, 0);
        assert_eq!(hits[1].row_id, 2);
    }

    #[test]
    fn rebuild_replaces_and_prunes_old_generations() {
        let (_tmp, manager) = manager();
        let book = id("physics");
        for _ in 0..4 {
            manager
                .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
                .unwrap();
        }

        let current = manager.current_generation(&book).unwrap();
        assert_eq!(parse_generation(&current), Some(4));
        let dir = manager.data_dir().textbook_dir(&book);
        let mut left: Vec<u64> = generations(&dir)
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        left.sort();
        assert_eq!(left, vec![3, 4]);
    }

    #[test]
    fn load_missing_is_index_not_found() {
        let (_tmp, manager) = manager();
        assert!(matches!(
            manager.load(&id("nope")),
            Err(Error::IndexNotFound(_))
        ));
    }

    #[test]
    fn empty_and_invalid_chapters_are_rejected_before_embedding() {
        let (_tmp, manager) = manager();
        let never = |_: &str| -> Result<Vec<f32>> {
            panic!("embedder must not be called")
        };

        assert!(matches!(
            manager.build_or_rebuild(&id("1"), &[], &never),
            Err(Error::EmptyInput)
        ));

        let mut bad = toy_chapters();
        bad[1].page_start = 99;
        assert!(matches!(
            manager.build_or_rebuild(&id("1"), &bad, &never),
            Err(Error::InvalidChapter { position: 1, .. })
        ));
    }

    #[test]
    fn embedding_failure_keeps_previous_index() {
        let (_tmp, manager) = manager();
        let book = id("3");
        let before = manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap()
            .generation;

        let failing = |text: &str| {
            if text == "beta" {
                Err(Error::Config("model offline".into()))
            } else {
                toy_embed(text)
            }
        };
        let err = manager
            .build_or_rebuild(&book, &toy_chapters(), &failing)
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailure(_)));

        assert_eq!(manager.current_generation(&book).unwrap(), before);
        assert_eq!(manager.load(&book).unwrap().index.len(), 3);
        let staging = manager.data_dir().staging_dir().unwrap();
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
    }

    #[test]
    fn mixed_dimensions_fail_the_build() {
        let (_tmp, manager) = manager();
        let ragged = |text: &str| -> Result<Vec<f32>> {
            Ok(if text == "gamma" {
                vec![1.0, 0.0, 0.0]
            } else {
                vec![1.0, 0.0]
            })
        };
        assert!(matches!(
            manager.build_or_rebuild(&id("r"), &toy_chapters(), &ragged),
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert!(matches!(
            manager.load(&id("r")),
            Err(Error::IndexNotFound(_))
        ));
    }

    #[test]
    fn provider_dimension_is_enforced() {
        let (_tmp, manager) = manager();
        let embedder = TrigramEmbedder::new(16);
        let summary = manager
            .build_or_rebuild(&id("t"), &toy_chapters(), &embedder)
            .unwrap();
        assert_eq!(summary.dimension, 16);
        assert_eq!(summary.model, "trigram-16");
    }

    #[test]
    fn aborted_build_leaves_previous_index() {
        let (_tmp, manager) = manager();
        let book = id("abort");
        let before = manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap()
            .generation;

        let abort = AbortHandle::new();
        let trigger = abort.clone();
        let embed = move |text: &str| {
            if text == "beta" {
                trigger.abort();
            }
            toy_embed(text)
        };
        let err = manager
            .build_with_abort(&book, &toy_chapters(), &embed, &abort)
            .unwrap_err();

        assert!(matches!(err, Error::BuildAborted(_)));
        assert_eq!(manager.current_generation(&book).unwrap(), before);
        assert!(manager.health_check(&book).ok);
    }

    #[test]
    fn concurrent_rebuild_of_same_textbook_is_rejected() {
        let (_tmp, manager) = manager();
        let book = id("busy");
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);

        let slow = move |text: &str| {
            if text == "alpha" {
                entered_tx.lock().unwrap().send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            }
            toy_embed(text)
        };

        std::thread::scope(|s| {
            let handle = s.spawn(|| {
                manager.build_or_rebuild(&book, &toy_chapters(), &slow)
            });
            entered_rx.recv().unwrap();

            assert!(matches!(
                manager.build_or_rebuild(&book, &toy_chapters(), &toy_embed),
                Err(Error::RebuildInProgress(_))
            ));
            assert!(matches!(
                manager.delete(&book),
                Err(Error::RebuildInProgress(_))
            ));
            // Other textbooks are unaffected.
            manager
                .build_or_rebuild(&id("other"), &toy_chapters(), &toy_embed)
                .unwrap();

            release_tx.send(()).unwrap();
            handle.join().unwrap().unwrap();
        });

        // The guard is released once the build finishes.
        manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap();
    }

    #[test]
    fn delete_is_idempotent() {
        let (_tmp, manager) = manager();
        let book = id("gone");
        assert!(!manager.delete(&book).unwrap());

        manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap();
        assert!(manager.delete(&book).unwrap());
        assert!(!manager.delete(&book).unwrap());
        assert!(matches!(
            manager.load(&book),
            Err(Error::IndexNotFound(_))
        ));
    }

    #[test]
    fn delete_goes_through_staging_and_leaves_nothing_behind() {
        let (_tmp, manager) = manager();
        let book = id("moved");
        manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap();

        assert!(manager.delete(&book).unwrap());
        assert!(!manager.data_dir().textbook_dir(&book).exists());
        let staging = manager.data_dir().staging_dir().unwrap();
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
        assert!(matches!(
            manager.health_check(&book).problem,
            Some(problem) if problem.contains("no index")
        ));
    }

    #[test]
    fn generation_names_are_not_reused_after_delete() {
        let (_tmp, manager) = manager();
        let book = id("again");
        let first = manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap()
            .generation;
        manager.delete(&book).unwrap();

        let second = manager
            .build_or_rebuild(&book, &toy_chapters()[..1], &toy_embed)
            .unwrap()
            .generation;
        assert_eq!(parse_generation(&first), Some(1));
        assert_eq!(parse_generation(&second), Some(1));
        assert_ne!(first, second);
    }

    #[test]
    fn generation_names_parse() {
        assert_eq!(parse_generation("gen-000007-0a1b2c"), Some(7));
        assert_eq!(parse_generation("gen-000007"), None);
        assert_eq!(parse_generation("gen-000007-"), None);
        assert_eq!(parse_generation("gen-000007-xyz"), None);
        assert_eq!(parse_generation("gen-abc-01"), None);
        assert_eq!(parse_generation("../etc"), None);
    }

    #[test]
    fn health_reports_ok_and_backup() {
        let (_tmp, manager) = manager();
        let book = id("h");
        manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap();

        let report = manager.health_check(&book);
        assert!(report.ok, "{report:?}");
        assert_eq!(report.vector_count, 3);
        assert_eq!(report.chapter_count, 3);
        assert_eq!(report.dimension, Some(2));
        assert_eq!(report.backup_count, Some(3));
        assert!(report.problem.is_none());
    }

    fn backup_path(manager: &IndexManager, book: &TextbookId) -> PathBuf {
        let generation = manager.current_generation(book).unwrap();
        manager
            .data_dir()
            .textbook_dir(book)
            .join(generation)
            .join(EMBEDDINGS_FILE)
    }

    #[test]
    fn short_backup_is_unhealthy() {
        let (_tmp, manager) = manager();
        let book = id("short");
        manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap();
        EmbeddingDb::open(&backup_path(&manager, &book))
            .unwrap()
            .store_all(&[vec![1.0, 0.0]])
            .unwrap();

        let report = manager.health_check(&book);
        assert!(!report.ok);
        assert_eq!(report.backup_count, Some(1));
        assert!(report.problem.unwrap().contains("backup holds 1 vectors"));
    }

    #[test]
    fn diverging_backup_is_unhealthy() {
        let (_tmp, manager) = manager();
        let book = id("drift");
        manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap();
        EmbeddingDb::open(&backup_path(&manager, &book))
            .unwrap()
            .store_all(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 0.0]])
            .unwrap();

        let report = manager.health_check(&book);
        assert!(!report.ok);
        assert_eq!(report.backup_count, Some(3));
        assert!(report.problem.unwrap().contains("row 2 differs"));
    }

    #[test]
    fn unreadable_backup_is_unhealthy() {
        let (_tmp, manager) = manager();
        let book = id("garbled");
        manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap();
        std::fs::write(backup_path(&manager, &book), b"garbage").unwrap();

        let report = manager.health_check(&book);
        assert!(!report.ok);
        assert_eq!(report.backup_count, None);
        assert!(report.problem.unwrap().contains("embeddings backup"));
        // Queries never read the backup.
        assert_eq!(manager.load(&book).unwrap().index.len(), 3);
    }

    #[test]
    fn health_reports_missing_index_without_failing() {
        let (_tmp, manager) = manager();
        let report = manager.health_check(&id("never"));
        assert!(!report.ok);
        assert!(report.generation.is_none());
        assert!(report.problem.unwrap().contains("no index"));
    }

    #[test]
    fn count_mismatch_is_corrupt_and_unhealthy() {
        let (_tmp, manager) = manager();
        let book = id("c");
        manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap();

        // Overwrite the vector file with a two-row index.
        let generation = manager.current_generation(&book).unwrap();
        let dir = manager.data_dir().textbook_dir(&book).join(generation);
        VectorIndex::build(&[vec![1.0, 0.0], vec![0.0, 1.0]])
            .unwrap()
            .write_to(&dir.join(VECTORS_FILE))
            .unwrap();

        assert!(matches!(
            manager.load(&book),
            Err(Error::CorruptIndex { .. })
        ));
        let report = manager.health_check(&book);
        assert!(!report.ok);
        assert_eq!(report.vector_count, 2);
        assert_eq!(report.chapter_count, 3);
    }

    #[test]
    fn missing_generation_files_are_corrupt() {
        let (_tmp, manager) = manager();
        let book = id("m");
        manager
            .build_or_rebuild(&book, &toy_chapters(), &toy_embed)
            .unwrap();

        let generation = manager.current_generation(&book).unwrap();
        let dir = manager.data_dir().textbook_dir(&book).join(generation);
        std::fs::remove_file(dir.join(CHAPTERS_FILE)).unwrap();

        assert!(matches!(
            manager.load(&book),
            Err(Error::CorruptIndex { .. })
        ));
    }

    #[test]
    fn garbage_pointer_is_corrupt() {
        let (_tmp, manager) = manager();
        let book = id("p");
        let dir = manager.data_dir().textbook_dir(&book);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CURRENT_FILE), "../../etc").unwrap();

        assert!(matches!(
            manager.load(&book),
            Err(Error::CorruptIndex { .. })
        ));
    }

    #[test]
    fn open_sweeps_stale_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let staging = data_dir.staging_dir().unwrap();
        std::fs::create_dir_all(staging.join("7-crashed/partial")).unwrap();
        std::fs::write(staging.join("stray.tmp"), b"x").unwrap();

        let _manager = IndexManager::open(data_dir).unwrap();
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
    }

    #[test]
    fn list_returns_published_textbooks() {
        let (_tmp, manager) = manager();
        manager
            .build_or_rebuild(&id("b"), &toy_chapters(), &toy_embed)
            .unwrap();
        manager
            .build_or_rebuild(&id("a"), &toy_chapters(), &toy_embed)
            .unwrap();
        let _ = manager.build_or_rebuild(&id("empty"), &[], &toy_embed);

        assert_eq!(manager.list().unwrap(), vec![id("a"), id("b")]);
    }
}

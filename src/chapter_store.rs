use std::{io::Write, path::Path};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Characters of chapter body kept alongside the index for previews.
pub const EXCERPT_CHARS: usize = 500;

const FORMAT_VERSION: u32 = 1;

/// A chapter as produced by the chapter extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Chapter {
    /// Chapter number as printed in the book. Defaults to position + 1.
    #[serde(default)]
    pub number: Option<u32>,
    pub title: String,
    pub page_start: u32,
    pub page_end: u32,
    /// Body text; only used to compute the embedding and the excerpt.
    pub content: String,
}

impl Chapter {
    /// Check the extractor contract: non-empty title, ordered page range.
    pub fn validate(&self, position: usize) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::InvalidChapter {
                position,
                reason: "title is empty".to_string(),
            });
        }
        if self.page_start > self.page_end {
            return Err(Error::InvalidChapter {
                position,
                reason: format!(
                    "page range {}-{} is reversed",
                    self.page_start, self.page_end
                ),
            });
        }
        Ok(())
    }
}

/// The persisted descriptor of one indexed chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub row_id: usize,
    pub number: u32,
    pub title: String,
    pub page_start: u32,
    pub page_end: u32,
    pub excerpt: String,
}

/// Row id -> chapter mapping, in the same order as the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterStore {
    records: Vec<ChapterRecord>,
}

/// On-disk form of a [`ChapterStore`] plus the facts needed to validate it
/// against its vector index.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChapterFile {
    pub format_version: u32,
    pub textbook_id: String,
    pub model: String,
    pub dimension: usize,
    pub chapters: Vec<ChapterRecord>,
}

impl ChapterStore {
    /// Assign row ids 0..n in input order.
    ///
    /// Chapters without a number are numbered by position, starting at 1.
    pub fn attach(chapters: &[Chapter]) -> Result<Self> {
        let records = chapters
            .iter()
            .enumerate()
            .map(|(row_id, ch)| {
                Ok(ChapterRecord {
                    row_id,
                    number: chapter_number(ch, row_id)?,
                    title: ch.title.trim().to_string(),
                    page_start: ch.page_start,
                    page_end: ch.page_end,
                    excerpt: truncate_chars(&ch.content, EXCERPT_CHARS)
                        .to_string(),
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self { records })
    }

    pub fn get(&self, row_id: usize) -> Result<&ChapterRecord> {
        self.records.get(row_id).ok_or(Error::RowNotFound {
            row_id,
            len: self.records.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChapterRecord> {
        self.records.iter()
    }

    pub fn write_to(
        &self,
        path: &Path,
        textbook_id: &str,
        model: &str,
        dimension: usize,
    ) -> Result<()> {
        let file = ChapterFile {
            format_version: FORMAT_VERSION,
            textbook_id: textbook_id.to_string(),
            model: model.to_string(),
            dimension,
            chapters: self.records.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let mut out = std::fs::File::create(path)?;
        out.write_all(&bytes)?;
        out.sync_all()?;
        Ok(())
    }

    /// Read and validate a chapter file. Returns the store together with the
    /// file header so callers can cross-check it against the vector index.
    pub fn read_from(path: &Path, textbook_id: &str) -> Result<(Self, ChapterFile)> {
        let bytes = std::fs::read(path)?;
        let corrupt = |reason: String| Error::CorruptIndex {
            textbook_id: textbook_id.to_string(),
            reason: format!("{}: {reason}", path.display()),
        };

        let mut file: ChapterFile = serde_json::from_slice(&bytes)
            .map_err(|e| corrupt(format!("unreadable metadata: {e}")))?;
        if file.format_version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {}",
                file.format_version
            )));
        }
        if file.textbook_id != textbook_id {
            return Err(corrupt(format!(
                "metadata belongs to textbook '{}'",
                file.textbook_id
            )));
        }
        if let Some(record) = file
            .chapters
            .iter()
            .enumerate()
            .find_map(|(i, r)| (r.row_id != i).then_some(r))
        {
            return Err(corrupt(format!(
                "row ids are not dense (found {} out of order)",
                record.row_id
            )));
        }

        let records = std::mem::take(&mut file.chapters);
        Ok((Self { records }, file))
    }
}

/// Longest prefix of `text` with at most `max` characters.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn chapter_number(chapter: &Chapter, row_id: usize) -> Result<u32> {
    if let Some(number) = chapter.number {
        return Ok(number);
    }
    row_id
        .checked_add(1)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| Error::InvalidChapter {
            position: row_id,
            reason: "too many chapters to number by position".to_string(),
        })
}

use std::path::{Path, PathBuf};

use crate::{
    error::{Error, Result},
    textbook_id::TextbookId,
};

pub const DATA_DIR_ENV_VAR: &str = "CHAPTERINDEX_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The CHAPTERINDEX_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/chapterindex/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("chapterindex")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        Self::ensure(&root)?;
        Ok(Self { root })
    }

    fn ensure(path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
            .map_err(|_| Error::DataDir(path.to_path_buf()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parent of every per-textbook index directory.
    pub fn textbooks_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("textbooks");
        Self::ensure(&path)?;
        Ok(path)
    }

    /// Scratch space for builds that have not been published yet.
    ///
    /// Lives on the same filesystem as `textbooks_dir` so publishing is a
    /// rename.
    pub fn staging_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("staging");
        Self::ensure(&path)?;
        Ok(path)
    }

    /// Directory owned by a single textbook. Not created here.
    pub fn textbook_dir(&self, id: &TextbookId) -> PathBuf {
        self.root.join("textbooks").join(id.as_str())
    }
}

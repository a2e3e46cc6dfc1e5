use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

const MAX_LEN: usize = 128;

/// Identifier of a textbook, used verbatim as its index directory name.
///
/// Ids are opaque to the engine (numeric database keys and slugs both work)
/// but must be safe path components: 1 to 128 characters from
/// `[A-Za-z0-9_.-]`, not starting with a dot.
///
/// # Examples
///
/// ```
/// use chapterindex::TextbookId;
///
/// let id: TextbookId = "42".parse().unwrap();
/// assert_eq!(id.as_str(), "42");
/// assert!("../etc".parse::<TextbookId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextbookId(String);

impl TextbookId {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if Self::is_valid(&raw) {
            Ok(Self(raw))
        } else {
            Err(Error::InvalidTextbookId(raw))
        }
    }

    fn is_valid(raw: &str) -> bool {
        !raw.is_empty()
            && raw.len() <= MAX_LEN
            && !raw.starts_with('.')
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for TextbookId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl FromStr for TextbookId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for TextbookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TextbookId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

//! Song identifiers and search result records.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque identifier of a song in the remote catalog.
///
/// Identifiers become file names in the cache, so anything that could
/// escape the cache directory is rejected on construction.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SongId(String);

impl SongId {
    /// Creates a song identifier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `id` is empty, is `.` or `..`, or contains
    /// a path separator or NUL character.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() || id == "." || id == ".." {
            return Err(Error::invalid_argument(format!("invalid song id \"{id}\"")));
        }

        if id.contains(['/', '\\', '\0']) {
            return Err(Error::invalid_argument(format!(
                "song id \"{}\" contains illegal characters",
                id.escape_debug()
            )));
        }

        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SongId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for SongId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<SongId> for String {
    fn from(id: SongId) -> Self {
        id.0
    }
}

impl AsRef<str> for SongId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A song as found by searching a provider's catalog.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Song {
    pub id: SongId,
    pub artist: String,
    pub title: String,
    pub album: String,
    pub duration: Duration,

    /// Name of the provider that can prepare this song.
    pub provider: String,

    /// Container format of the prepared file.
    pub format: String,

    /// Relevance as scored by the provider; higher is better.
    pub score: f64,
}

impl fmt::Display for Song {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: \"{} - {}\"", self.id, self.artist, self.title)
    }
}

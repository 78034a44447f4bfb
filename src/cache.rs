//! On-disk cache of prepared songs.
//!
//! Every provider owns one directory under the cache root:
//!
//! ```text
//! <cache root>/<provider>/<song id>.<ext>             complete songs
//! <cache root>/<provider>/incomplete/<song id>.<ext>  songs being prepared
//! ```
//!
//! A file at the final path is always complete: files are only ever moved
//! there by an atomic rename from the `incomplete` directory, which lives on
//! the same file system. The cache never deletes final files.

use std::{
    io,
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    song::SongId,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cache {
    /// Directory of complete songs.
    dir: PathBuf,

    /// Directory of songs being prepared.
    incomplete_dir: PathBuf,

    /// File extension of cached songs.
    extension: String,
}

impl Cache {
    /// Name of the directory holding temporary files.
    const INCOMPLETE_DIR: &'static str = "incomplete";

    /// Creates the cache for `provider` under `cache_root`.
    ///
    /// Does not touch the file system; see [`Cache::create_dirs`].
    #[must_use]
    pub fn new(cache_root: &Path, provider: &str, extension: &str) -> Self {
        let dir = cache_root.join(provider);
        let incomplete_dir = dir.join(Self::INCOMPLETE_DIR);

        Self {
            dir,
            incomplete_dir,
            extension: extension.to_owned(),
        }
    }

    /// Creates the cache directories if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory could not be created.
    pub async fn create_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.incomplete_dir).await?;
        debug!("cache directory: {}", self.dir.display());
        Ok(())
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(&self, id: &SongId) -> String {
        format!("{id}.{}", self.extension)
    }

    /// Path of the complete, playable file for `id`.
    #[must_use]
    pub fn path_for(&self, id: &SongId) -> PathBuf {
        self.dir.join(self.file_name(id))
    }

    /// Path of the temporary file that `id` is prepared into.
    #[must_use]
    pub fn temp_path_for(&self, id: &SongId) -> PathBuf {
        self.incomplete_dir.join(self.file_name(id))
    }

    /// Whether `id` is cached and ready to play.
    #[must_use]
    pub fn exists(&self, id: &SongId) -> bool {
        self.path_for(id).is_file()
    }

    /// Atomically moves the temporary file of `id` to its final path.
    ///
    /// # Errors
    ///
    /// Returns `DataLoss` if the temporary file does not exist. Someone else
    /// removed it while it was being prepared, which should never happen.
    /// Other I/O errors are returned as is.
    pub async fn promote(&self, id: &SongId) -> Result<PathBuf> {
        let temp_path = self.temp_path_for(id);
        let path = self.path_for(id);

        match tokio::fs::rename(&temp_path, &path).await {
            Ok(()) => {
                trace!("promoted {} to {}", temp_path.display(), path.display());
                Ok(path)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                error!(
                    "cache inconsistency: {} vanished before it could be promoted",
                    temp_path.display()
                );
                Err(Error::data_loss(format!(
                    "temporary file of {id} disappeared before promotion"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the temporary file of `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but could not be removed.
    pub async fn discard(&self, id: &SongId) -> Result<()> {
        let temp_path = self.temp_path_for(id);
        match tokio::fs::remove_file(&temp_path).await {
            Ok(()) => {
                trace!("removed {}", temp_path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

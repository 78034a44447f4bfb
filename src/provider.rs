//! Boundary to the remote music provider.
//!
//! A provider knows how to turn a [`SongId`] into a URL that serves the raw
//! audio, and how to re-establish its session when the network failed.

use async_trait::async_trait;
use url::Url;

use crate::{
    error::Result,
    song::{Song, SongId},
};

#[async_trait]
pub trait Provider: Send + Sync {
    /// Short, file system safe name of the provider.
    ///
    /// Used as the name of the provider's cache directory.
    fn name(&self) -> &str;

    /// Resolves `id` to a URL serving the raw audio stream.
    ///
    /// The URL may redirect, and is usually valid for a short time only.
    async fn stream_url(&self, id: &SongId) -> Result<Url>;

    /// Re-establishes the session with the provider after a network failure.
    async fn reinitialize(&self) -> Result<()>;

    /// Searches the catalog, returning at most `limit` songs.
    async fn search(&self, terms: &str, limit: usize) -> Result<Vec<Song>>;
}

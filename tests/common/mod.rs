//! Shared fixtures for the integration tests.
#![allow(dead_code)]

pub mod server;

use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use url::Url;

use songprep::{
    config::{Config, TranscoderConfig},
    error::Result,
    provider::Provider,
    song::{Song, SongId},
};

pub use server::TestServer;

pub const USERNAME: &str = "someone@example.com";
pub const PASSWORD: &str = "hunter2";

/// Length of the song served by the test server.
pub const SONG_LEN: usize = 64 * 1024;

/// Contents of the song served by the test server.
pub fn song_data() -> Vec<u8> {
    (0..SONG_LEN).map(|i| (i % 251) as u8).collect()
}

pub fn song_id(id: &str) -> SongId {
    id.parse().unwrap()
}

/// Configuration that transcodes with `script` instead of `ffmpeg`, and
/// reconnects without waiting long.
pub fn config_with(cache_root: &Path, script: &str) -> Config {
    let mut config = Config::new(cache_root);
    config.reconnect_backoff = Duration::from_millis(50);
    config.transcoder = TranscoderConfig {
        program: "sh".to_owned(),
        args: vec!["-c".to_owned(), script.to_owned()],
        extension: "opus".to_owned(),
    };
    config
}

/// Configuration whose transcoder copies its input unchanged.
pub fn config(cache_root: &Path) -> Config {
    config_with(cache_root, "cat")
}

/// Provider that hands out fixed stream URLs and counts its calls.
///
/// The n-th call to `stream_url` returns the n-th URL; once exhausted, the
/// last one is repeated.
pub struct MockProvider {
    urls: Vec<Url>,
    stream_url_calls: AtomicUsize,
    reinitialize_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(urls: impl IntoIterator<Item = Url>) -> Arc<Self> {
        let urls: Vec<_> = urls.into_iter().collect();
        assert!(!urls.is_empty(), "mock provider needs a stream url");

        Arc::new(Self {
            urls,
            stream_url_calls: AtomicUsize::new(0),
            reinitialize_calls: AtomicUsize::new(0),
        })
    }

    pub fn stream_url_calls(&self) -> usize {
        self.stream_url_calls.load(Ordering::SeqCst)
    }

    pub fn reinitialize_calls(&self) -> usize {
        self.reinitialize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream_url(&self, _id: &SongId) -> Result<Url> {
        let n = self.stream_url_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.urls[n.min(self.urls.len() - 1)].clone())
    }

    async fn reinitialize(&self) -> Result<()> {
        self.reinitialize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn search(&self, _terms: &str, _limit: usize) -> Result<Vec<Song>> {
        Ok(Vec::new())
    }
}

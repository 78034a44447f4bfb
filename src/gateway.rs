//! Provider backed by a JSON HTTP gateway.
//!
//! The gateway fronts the music service and speaks a small JSON protocol:
//!
//! * `POST login` with `{"username", "password"}` returns `{"token"}`
//! * `GET stream_url?id=<song id>` returns `{"url"}`
//! * `GET search?q=<terms>&max=<n>` returns `{"entries": [...]}`
//!
//! Requests other than `login` carry the token as bearer authorization. A
//! token the gateway no longer accepts is renewed once per request.
//!
//! All API calls go through the rate limiter of [`http::Client`]. The
//! streams themselves are fetched elsewhere.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_with::{formats::Flexible, serde_as, DisplayFromStr, DurationMilliSeconds, PickFirst};
use tokio::sync::RwLock;
use url::Url;
use veil::Redact;

use crate::{
    config::Config,
    credentials::Credentials,
    error::{Error, Result},
    http::Client as HttpClient,
    provider::Provider,
    song::{Song, SongId},
};

/// Session token handed out by `login`.
#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
#[redact(all)]
struct Token(String);

#[derive(Deserialize)]
struct Login {
    token: Token,
}

#[derive(Deserialize)]
struct StreamUrl {
    url: Url,
}

#[derive(Deserialize)]
struct SearchResults {
    #[serde(default)]
    entries: Vec<Entry>,
}

#[serde_as]
#[derive(Deserialize)]
struct Entry {
    /// `"1"` for songs; albums and artists have other types.
    #[serde(rename = "type")]
    kind: String,

    #[serde(default)]
    track: Option<Track>,

    #[serde(default)]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    score: f64,
}

#[serde_as]
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Track {
    /// Validated when the entry is turned into a [`Song`].
    nid: String,

    #[serde(default)]
    artist: String,

    #[serde(default)]
    title: String,

    #[serde(default)]
    album: String,

    #[serde(default)]
    #[serde_as(as = "DurationMilliSeconds<String, Flexible>")]
    duration_millis: Duration,
}

impl Entry {
    const SONG: &'static str = "1";
}

pub struct Gateway {
    http_client: HttpClient,
    base_url: Url,
    credentials: Credentials,
    token: RwLock<Option<Token>>,
}

impl Gateway {
    /// Name of the provider, and of its cache directory.
    pub const NAME: &'static str = "gmusic";

    /// Format of the songs as prepared from this provider.
    pub const FORMAT: &'static str = "opus";

    /// The gateway returns at most this many search results.
    pub const MAX_SEARCH_RESULTS: usize = 100;

    /// Creates a gateway provider. Does not connect yet; see
    /// [`Gateway::connect`].
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client could not be built.
    pub fn new(config: &Config, credentials: Credentials) -> Result<Self> {
        let mut base_url = config.gateway_url.clone();
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            http_client: HttpClient::new(config)?,
            base_url,
            credentials,
            token: RwLock::new(None),
        })
    }

    /// Logs in to the gateway.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated` if the credentials were refused, and
    /// network and protocol errors otherwise.
    pub async fn connect(&self) -> Result<()> {
        let token = self.login().await?;
        *self.token.write().await = Some(token);
        info!("logged in to {} as {}", self.base_url, self.credentials.username);
        Ok(())
    }

    async fn login(&self) -> Result<Token> {
        let url = self.endpoint("login")?;
        let request = self.http_client.post_json(url, &self.credentials)?;
        let response = Self::check(self.http_client.execute(request).await?)?;
        let login = response.json::<Login>().await?;
        trace!("login: {{ ... }}");

        Ok(login.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(Into::into)
    }

    /// Maps unsuccessful status codes to errors.
    fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        match status {
            s if s.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::unauthenticated(
                format!("gateway refused authorization ({status})"),
            )),
            StatusCode::NOT_FOUND => Err(Error::not_found(format!(
                "{} not found on gateway",
                response.url().path()
            ))),
            _ => Err(Error::failed_precondition(format!(
                "gateway responded with {status}"
            ))),
        }
    }

    /// Sends an authorized `GET` to `url`, logging in first if needed and
    /// once more if the token was refused.
    async fn get<T>(&self, url: Url) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut renewed = false;
        loop {
            let current = self.token.read().await.clone();
            let token = match current {
                Some(token) => token,
                None => {
                    self.connect().await?;
                    renewed = true;
                    continue;
                }
            };

            let request = self.http_client.get_authorized(url.clone(), &token.0)?;
            let response = self.http_client.execute(request).await?;
            if response.status() == StatusCode::UNAUTHORIZED && !renewed {
                debug!("gateway token expired; logging in again");
                *self.token.write().await = None;
                continue;
            }

            return Self::check(response)?.json::<T>().await.map_err(Into::into);
        }
    }
}

#[async_trait]
impl Provider for Gateway {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn stream_url(&self, id: &SongId) -> Result<Url> {
        let mut url = self.endpoint("stream_url")?;
        url.query_pairs_mut().append_pair("id", id.as_str());

        let stream = self.get::<StreamUrl>(url).await?;
        trace!("stream url of song {id}: {}", stream.url);
        Ok(stream.url)
    }

    async fn reinitialize(&self) -> Result<()> {
        self.connect().await
    }

    async fn search(&self, terms: &str, limit: usize) -> Result<Vec<Song>> {
        let limit = limit.min(Self::MAX_SEARCH_RESULTS);

        let mut url = self.endpoint("search")?;
        url.query_pairs_mut()
            .append_pair("q", terms)
            .append_pair("max", &limit.to_string());

        let results = self.get::<SearchResults>(url).await.map_err(|e| {
            Error::new(
                e.kind,
                format!("error while searching {}: {}", Self::NAME, e.error),
            )
        })?;

        let songs = songs(results, limit);
        debug!("search for \"{terms}\" found {} songs", songs.len());
        Ok(songs)
    }
}

/// Keeps the songs among the search results.
fn songs(results: SearchResults, limit: usize) -> Vec<Song> {
    results
        .entries
        .into_iter()
        .filter(|entry| entry.kind == Entry::SONG)
        .filter_map(|entry| {
            let Some(track) = entry.track else {
                warn!("ignoring song search result without track");
                return None;
            };

            let id = match SongId::new(track.nid) {
                Ok(id) => id,
                Err(e) => {
                    debug!("ignoring song search result: {e}");
                    return None;
                }
            };

            Some(Song {
                id,
                artist: track.artist,
                title: track.title,
                album: track.album,
                duration: track.duration_millis,
                provider: Gateway::NAME.to_owned(),
                format: Gateway::FORMAT.to_owned(),
                score: entry.score,
            })
        })
        .take(limit)
        .collect()
}

//! Fetching raw audio streams from the provider.
//!
//! The [`Fetcher`] resolves a song to a stream URL and forwards the response
//! body, chunk by chunk, into a channel that feeds the transcoder.
//!
//! # Redirects
//!
//! Redirects are followed by hand, so that the body of a redirect response is
//! never mistaken for audio. At most [`Config::max_redirects`] redirects are
//! followed for each resolved URL.
//!
//! # Reconnecting
//!
//! Transport errors, like a refused connection, a reset or a stalled read, are
//! never fatal. The fetcher waits [`Config::reconnect_backoff`], asks the
//! provider to re-establish its session, resolves a fresh stream URL and
//! continues. There is no limit on the number of reconnects. To not feed the
//! transcoder the same bytes twice, the new request asks for the remainder
//! only; servers that ignore the range have the delivered prefix skipped.
//!
//! HTTP status errors are never retried, and neither are bodies that fail to
//! decode: those would fail the same way on every attempt.
//!
//! # Cancellation
//!
//! Dropping the future returned by [`Fetcher::fetch`] aborts the request
//! and any pending reconnect.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::{
    header::{LOCATION, RANGE},
    StatusCode,
};
use tokio::sync::mpsc;
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
    provider::Provider,
    song::SongId,
};

/// Retrieves raw audio streams for songs.
pub struct Fetcher {
    client: reqwest::Client,
    provider: Arc<dyn Provider>,
    backoff: Duration,
    max_redirects: usize,
}

/// How a single request ended.
enum Transfer {
    /// The whole body was forwarded.
    Complete,

    /// The server redirected to another location.
    Redirect(Url),
}

/// Why a single request did not end normally.
enum Interrupt {
    /// Connection level failure; recoverable by reconnecting.
    Transport(reqwest::Error),

    /// Anything else; ends the fetch.
    Fatal(Error),
}

impl From<reqwest::Error> for Interrupt {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() || e.is_decode() {
            Self::Fatal(e.into())
        } else {
            Self::Transport(e)
        }
    }
}

impl From<Error> for Interrupt {
    fn from(e: Error) -> Self {
        Self::Fatal(e)
    }
}

impl Fetcher {
    /// Creates a fetcher using `client` for the streams and `provider` to
    /// resolve them.
    ///
    /// `client` must not follow redirects by itself.
    #[must_use]
    pub fn new(config: &Config, client: reqwest::Client, provider: Arc<dyn Provider>) -> Self {
        Self {
            client,
            provider,
            backoff: config.reconnect_backoff,
            max_redirects: config.max_redirects,
        }
    }

    /// Fetches the raw stream of `id` into `output`.
    ///
    /// Returns the number of bytes forwarded. `output` is dropped on return,
    /// which signals the end of the stream to the receiver. Only on `Ok`
    /// is the stream complete.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * the stream URL could not be resolved
    /// * the session could not be re-established after a transport error
    /// * the server responded with a status other than success or redirect
    /// * the server redirected too often, or without a location
    /// * the receiving end of `output` was closed
    pub async fn fetch(&self, id: &SongId, output: mpsc::Sender<Bytes>) -> Result<u64> {
        let mut url = self.provider.stream_url(id).await?;
        let mut redirects = 0;
        let mut delivered = 0;

        debug!("downloading song {id}");
        loop {
            match self.transfer(&url, &mut delivered, &output).await {
                Ok(Transfer::Complete) => {
                    debug!("download of song {id} finished ({delivered} bytes)");
                    return Ok(delivered);
                }

                Ok(Transfer::Redirect(location)) => {
                    redirects += 1;
                    if redirects > self.max_redirects {
                        return Err(Error::resource_exhausted(format!(
                            "too many redirects fetching song {id} (more than {})",
                            self.max_redirects
                        )));
                    }

                    debug!("song {id} redirected; retrying with new URL");
                    trace!("redirect location: {location}");
                    url = location;
                }

                Err(Interrupt::Transport(e)) => {
                    error!(
                        "{e} while fetching song {id}; reconnecting in {:.1}s",
                        self.backoff.as_secs_f32()
                    );
                    tokio::time::sleep(self.backoff).await;

                    self.provider.reinitialize().await?;
                    warn!("reconnected to {} after fetch error", self.provider.name());

                    url = self.provider.stream_url(id).await?;
                    redirects = 0;
                }

                Err(Interrupt::Fatal(e)) => return Err(e),
            }
        }
    }

    /// Performs one request to `url`, forwarding its body to `output`.
    ///
    /// `delivered` counts the bytes forwarded over all requests of this fetch
    /// and is updated as chunks are forwarded.
    async fn transfer(
        &self,
        url: &Url,
        delivered: &mut u64,
        output: &mpsc::Sender<Bytes>,
    ) -> std::result::Result<Transfer, Interrupt> {
        let mut request = self.client.get(url.clone());
        if *delivered > 0 {
            request = request.header(RANGE, format!("bytes={delivered}-"));
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .ok_or_else(|| {
                    Error::failed_precondition(format!("redirect status code {status} without location"))
                })?
                .to_str()
                .map_err(Error::from)?;
            let location = url.join(location).map_err(Error::from)?;
            return Ok(Transfer::Redirect(location));
        }

        // A server that ignores the range sends everything again.
        let mut skip = match status {
            StatusCode::OK => *delivered,
            StatusCode::PARTIAL_CONTENT if *delivered > 0 => 0,
            code => {
                return Err(Interrupt::Fatal(Error::failed_precondition(format!(
                    "unknown status code {}",
                    code.as_u16()
                ))));
            }
        };

        if skip > 0 {
            debug!("server ignored range request; skipping {skip} bytes");
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let mut chunk = chunk?;

            if skip > 0 {
                #[expect(clippy::cast_possible_truncation)]
                let len = skip.min(chunk.len() as u64) as usize;
                let _ = chunk.split_to(len);
                skip -= len as u64;
                if chunk.is_empty() {
                    continue;
                }
            }

            let len = chunk.len() as u64;
            output
                .send(chunk)
                .await
                .map_err(|_| Error::aborted("transcoder stopped accepting input"))?;
            *delivered += len;
        }

        if skip > 0 {
            return Err(Interrupt::Fatal(Error::data_loss(format!(
                "stream shrank by {skip} bytes after reconnecting"
            ))));
        }

        Ok(Transfer::Complete)
    }
}

//! Preparing songs for playback.
//!
//! The [`Preparer`] turns a [`SongId`] into a cached, transcoded file. Songs
//! that are cached already are reported ready at once. Otherwise a task is
//! spawned that fetches the raw stream and transcodes it while it downloads,
//! and promotes the result into the cache once the transcoder exited
//! successfully.
//!
//! # Progress and results
//!
//! Each call to [`Preparer::prepare`] returns a [`Preparation`]: a stream of
//! [`Progress::Written`] events followed by exactly one terminal item, either
//! `Ok(Progress::Done)` or an error. The terminal item is only delivered
//! after the temporary file was promoted or removed.
//!
//! # One preparation per song
//!
//! Preparing a song that is already being prepared does not start a second
//! download: the new [`Preparation`] attaches to the running one and receives
//! its progress from then on, and its result.
//!
//! Cancellation is counted per attached [`Preparation`]. Cancelling one of
//! several only detaches it, with its own cancellation error. Cancelling the
//! last one stops the download and the transcoder. Cancelling after the
//! terminal item was delivered does nothing.
//!
//! # Example
//!
//! ```rust
//! use songprep::{events::Progress, prepare::Preparer};
//!
//! let preparer = Preparer::new(&config, provider)?;
//! let mut preparation = preparer.prepare(&id);
//!
//! while let Some(item) = preparation.next().await {
//!     match item {
//!         Ok(Progress::Written(len)) => println!("{len} more bytes"),
//!         Ok(Progress::Done) => println!("ready"),
//!         Err(e) => eprintln!("failed: {e}"),
//!     }
//! }
//! ```

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError, Weak},
    task::{Context, Poll},
};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::Cache,
    config::Config,
    error::{Error, Result},
    events::Progress,
    fetch::Fetcher,
    http,
    provider::Provider,
    song::SongId,
    transcode::Transcoder,
};

/// Number of raw stream chunks buffered between fetcher and transcoder.
const STREAM_BUFFER_CHUNKS: usize = 16;

type Event = Result<Progress>;

/// Prepares songs of a single provider.
#[derive(Clone)]
pub struct Preparer {
    inner: Arc<Inner>,
}

struct Inner {
    cache: Cache,
    fetcher: Fetcher,
    transcoder: Transcoder,
    in_flight: Mutex<HashMap<SongId, Arc<Job>>>,
}

impl Preparer {
    /// Creates a preparer for songs of `provider`.
    ///
    /// Cached files are kept in a directory named after the provider under
    /// the configured cache root. See [`Cache::create_dirs`] to create it.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client could not be built.
    pub fn new(config: &Config, provider: Arc<dyn Provider>) -> Result<Self> {
        let cache = Cache::new(
            &config.cache_root,
            provider.name(),
            &config.transcoder.extension,
        );
        let client = http::Client::new(config)?;
        let fetcher = Fetcher::new(config, client.streaming(), provider);
        let transcoder = Transcoder::new(&config.transcoder);

        Ok(Self {
            inner: Arc::new(Inner {
                cache,
                fetcher,
                transcoder,
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    /// Whether `id` is cached and ready to play.
    #[must_use]
    pub fn is_prepared(&self, id: &SongId) -> bool {
        self.inner.cache.exists(id)
    }

    /// Prepares `id` for playback.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime, unless `id` is cached
    /// already.
    #[must_use]
    pub fn prepare(&self, id: &SongId) -> Preparation {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(job) = in_flight.get(id) {
            debug!("song {id} is being prepared already; attaching");
            return Preparation::attach(id, job);
        }

        if self.inner.cache.exists(id) {
            trace!("song {id} is cached");
            return Preparation::ready(id);
        }

        let job = Arc::new(Job::new(id));
        in_flight.insert(id.clone(), Arc::clone(&job));
        let preparation = Preparation::attach(id, &job);

        let inner = Arc::clone(&self.inner);
        let id = id.clone();
        tokio::spawn(async move { inner.drive(id, job).await });

        preparation
    }
}

impl Inner {
    /// Runs `job` to completion and reports the result to its listeners.
    async fn drive(&self, id: SongId, job: Arc<Job>) {
        let result = self.run(&id, &job).await;

        match &result {
            Ok(written) => info!("prepared song {id} ({written} bytes)"),
            Err(e) if e.is_cancelled() => debug!("{e}"),
            Err(e) => error!("preparing song {id} failed: {e}"),
        }

        // Release the song before reporting, so that listeners that prepare
        // it again start afresh.
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        job.finish(result);
    }

    async fn run(&self, id: &SongId, job: &Job) -> Result<u64> {
        let mut transcode = self
            .transcoder
            .spawn(&self.cache.temp_path_for(id))
            .await?;
        trace!("transcoding song {id}");

        let (tx, rx) = mpsc::channel(STREAM_BUFFER_CHUNKS);
        let fetch = self.fetcher.fetch(id, tx);
        let transcode_run = transcode.run(rx, &job.cancel, |len| {
            job.publish(Progress::Written(len));
        });

        let written = match tokio::try_join!(fetch, transcode_run) {
            Ok((_, written)) => written,
            Err(e) => {
                // The transcoder cleans up after itself, but not when the
                // fetch failed first.
                transcode.terminate().await;
                self.cache.discard(id).await?;

                return Err(if e.is_cancelled() {
                    Error::cancelled(format!("canceled preparing {id}"))
                } else {
                    e
                });
            }
        };

        let state = transcode.state();
        if !state.is_success() {
            self.cache.discard(id).await?;
            return Err(Error::internal(format!(
                "transcoder of song {id} is {state} after transcoding"
            )));
        }

        // Closed by now, because the transcoder completed.
        drop(transcode);

        match self.cache.promote(id).await {
            Ok(path) => {
                trace!("song {id} cached at {}", path.display());
                Ok(written)
            }
            Err(e) => {
                self.cache.discard(id).await?;
                Err(e)
            }
        }
    }
}

/// A preparation in flight, shared by everyone who asked for it.
struct Job {
    id: SongId,
    cancel: CancellationToken,
    listeners: Mutex<Listeners>,
}

#[derive(Default)]
struct Listeners {
    next_key: usize,
    senders: Vec<(usize, mpsc::UnboundedSender<Event>)>,
    finished: bool,
}

impl Listeners {
    fn live(&self) -> usize {
        self.senders.iter().filter(|(_, tx)| !tx.is_closed()).count()
    }
}

impl Job {
    fn new(id: &SongId) -> Self {
        Self {
            id: id.clone(),
            cancel: CancellationToken::new(),
            listeners: Mutex::new(Listeners::default()),
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a listener, returning its key and receiving end.
    fn subscribe(&self) -> (usize, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners();
        let key = listeners.next_key;
        listeners.next_key += 1;
        listeners.senders.push((key, tx));
        (key, rx)
    }

    /// Sends a non-terminal event to all listeners.
    fn publish(&self, progress: Progress) {
        self.listeners()
            .senders
            .retain(|(_, tx)| tx.send(Ok(progress)).is_ok());
    }

    /// Sends the terminal item to all listeners.
    fn finish(&self, result: Result<u64>) {
        let senders = {
            let mut listeners = self.listeners();
            listeners.finished = true;
            std::mem::take(&mut listeners.senders)
        };

        for (_, tx) in senders {
            let item = match &result {
                Ok(_) => Ok(Progress::Done),
                Err(e) => Err(e.duplicate()),
            };
            let _ = tx.send(item);
        }
    }

    /// Cancels on behalf of the listener with `key`.
    ///
    /// A listener that is gone, because it was dropped or detached before,
    /// has nothing left to cancel.
    fn cancel(&self, key: usize) {
        let mut listeners = self.listeners();
        if listeners.finished {
            trace!("preparation of song {} finished already", self.id);
            return;
        }

        let Some(pos) = listeners
            .senders
            .iter()
            .position(|(k, tx)| *k == key && !tx.is_closed())
        else {
            trace!("listener {key} left preparation of song {}", self.id);
            return;
        };

        if listeners.live() > 1 {
            let (_, tx) = listeners.senders.remove(pos);
            debug!("detached from preparation of song {}", self.id);
            let _ = tx.send(Err(Error::cancelled(format!(
                "canceled preparing {}",
                self.id
            ))));
            return;
        }

        if !self.cancel.is_cancelled() {
            debug!("canceling preparation of song {}", self.id);
            self.cancel.cancel();
        }
    }
}

/// Cancels a [`Preparation`].
///
/// Cloneable and safe to use at any time: once the preparation finished,
/// cancelling does nothing.
#[derive(Clone, Default)]
pub struct CancelHandle {
    job: Option<(Weak<Job>, usize)>,
}

impl CancelHandle {
    /// Cancels the preparation.
    ///
    /// If others are waiting for the same song, only this preparation is
    /// detached; otherwise the download and the transcoder are stopped and
    /// the temporary file is removed. The preparation ends with a
    /// cancellation error either way.
    pub fn cancel(&self) {
        if let Some((job, key)) = &self.job {
            if let Some(job) = job.upgrade() {
                job.cancel(*key);
            }
        }
    }
}

/// Progress and result of preparing one song.
pub struct Preparation {
    id: SongId,
    items: mpsc::UnboundedReceiver<Event>,
    cancel: CancelHandle,
}

impl Preparation {
    /// A preparation of a song that is cached already.
    fn ready(id: &SongId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(Progress::Done));

        Self {
            id: id.clone(),
            items: rx,
            cancel: CancelHandle::default(),
        }
    }

    fn attach(id: &SongId, job: &Arc<Job>) -> Self {
        let (key, rx) = job.subscribe();

        Self {
            id: id.clone(),
            items: rx,
            cancel: CancelHandle {
                job: Some((Arc::downgrade(job), key)),
            },
        }
    }

    #[must_use]
    pub fn id(&self) -> &SongId {
        &self.id
    }

    /// Waits for the next event.
    ///
    /// Returns `None` after the terminal item was returned.
    pub async fn next(&mut self) -> Option<Result<Progress>> {
        self.items.recv().await
    }

    /// See [`CancelHandle::cancel`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle to cancel this preparation from elsewhere.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Waits for the preparation to end, returning the number of bytes that
    /// were reported written.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the preparation.
    pub async fn finish(mut self) -> Result<u64> {
        let mut written = 0;
        while let Some(item) = self.next().await {
            match item? {
                Progress::Written(len) => written += len as u64,
                Progress::Done => return Ok(written),
            }
        }

        Err(Error::internal(format!(
            "preparation of song {} ended without result",
            self.id
        )))
    }
}

impl Stream for Preparation {
    type Item = Result<Progress>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items.poll_recv(cx)
    }
}

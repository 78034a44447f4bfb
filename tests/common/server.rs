//! In-process HTTP server standing in for the gateway and the stream hosts.
//!
//! Every test spawns its own server on a random port, so request counters
//! are never shared between tests.

use std::{
    collections::HashMap,
    convert::Infallible,
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{
        header::{AUTHORIZATION, LOCATION, RANGE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::oneshot};
use url::Url;

use super::{song_data, PASSWORD, USERNAME};

/// Bytes sent by the flaky routes before the connection drops.
pub const FLAKY_PREFIX_LEN: usize = 16 * 1024;

#[derive(Clone)]
pub struct TestState {
    base_url: Url,

    /// Requests made to the flaky routes.
    pub flaky_requests: Arc<AtomicUsize>,

    /// `Range` headers received by the flaky routes, in order.
    pub ranges: Arc<Mutex<Vec<Option<String>>>>,

    /// Successful logins.
    pub logins: Arc<AtomicUsize>,

    /// Whether the first token handed out is refused once it is used.
    pub expire_first_token: Arc<AtomicBool>,

    /// `max` parameter of the last search.
    pub search_max: Arc<Mutex<Option<String>>>,
}

/// Test server; shuts down when dropped.
pub struct TestServer {
    pub base_url: Url,
    pub state: TestState,
    _shutdown_tx: oneshot::Sender<()>,
}

impl TestServer {
    /// Spawns a new test server on a random port.
    ///
    /// The listener is bound before this returns, so the server accepts
    /// connections right away.
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();

        let state = TestState {
            base_url: base_url.clone(),
            flaky_requests: Arc::default(),
            ranges: Arc::default(),
            logins: Arc::default(),
            expire_first_token: Arc::default(),
            search_max: Arc::default(),
        };

        let app = Router::new()
            .route("/song", get(song))
            .route("/slow", get(slow))
            .route("/endless", get(endless))
            .route("/redirect/{hops}", get(redirect))
            .route("/flaky", get(flaky::<true>))
            .route("/flaky-no-range", get(flaky::<false>))
            .route("/login", post(login))
            .route("/stream_url", get(stream_url))
            .route("/search", get(search))
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        Self {
            base_url,
            state,
            _shutdown_tx: shutdown_tx,
        }
    }

    pub fn url(&self, path: &str) -> Url {
        self.base_url.join(path).unwrap()
    }
}

/// A URL on which nothing listens.
pub fn closed_url() -> Url {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Url::parse(&format!("http://127.0.0.1:{port}/song")).unwrap()
}

fn delayed<I>(items: I, delay: Duration) -> Body
where
    I: IntoIterator<Item = io::Result<Bytes>>,
    I::IntoIter: Send + 'static,
{
    let items = stream::iter(items).then(move |item| async move {
        tokio::time::sleep(delay).await;
        item
    });
    Body::from_stream(items)
}

async fn song() -> Vec<u8> {
    song_data()
}

/// The song in eight chunks, 30 ms apart.
async fn slow() -> Body {
    let chunks: Vec<_> = song_data()
        .chunks(song_data().len() / 8)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    delayed(chunks, Duration::from_millis(30))
}

static FILLER: [u8; 1024] = [0x55; 1024];

/// A stream that never ends.
async fn endless() -> Body {
    let chunks = stream::unfold((), |()| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Some((Ok::<_, Infallible>(Bytes::from_static(&FILLER)), ()))
    });
    Body::from_stream(chunks)
}

async fn redirect(Path(hops): Path<usize>) -> Response {
    let location = match hops {
        0 => "/song".to_owned(),
        n => format!("/redirect/{}", n - 1),
    };

    // The body must never end up in the output.
    (StatusCode::FOUND, [(LOCATION, location)], "moved elsewhere").into_response()
}

/// Drops the connection on the first request after sending a prefix of the
/// song. Later requests get the song, or with `HONOR_RANGE` the requested
/// remainder.
async fn flaky<const HONOR_RANGE: bool>(
    State(state): State<TestState>,
    headers: HeaderMap,
) -> Response {
    let attempt = state.flaky_requests.fetch_add(1, Ordering::SeqCst);
    let range = headers
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    state.ranges.lock().unwrap().push(range.clone());

    let data = song_data();
    if attempt == 0 {
        let prefix = Bytes::copy_from_slice(&data[..FLAKY_PREFIX_LEN]);
        return delayed(
            [Ok(prefix), Err(io::Error::other("connection lost"))],
            Duration::from_millis(50),
        )
        .into_response();
    }

    let start = range
        .as_deref()
        .and_then(|range| range.strip_prefix("bytes="))
        .and_then(|range| range.strip_suffix('-'))
        .and_then(|start| start.parse::<usize>().ok());

    match start {
        Some(start) if HONOR_RANGE => {
            (StatusCode::PARTIAL_CONTENT, data[start..].to_vec()).into_response()
        }
        _ => data.into_response(),
    }
}

async fn login(State(state): State<TestState>, Json(body): Json<Value>) -> Response {
    if body["username"] != USERNAME || body["password"] != PASSWORD {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "token": format!("token-{n}") })).into_response()
}

fn authorized(state: &TestState, headers: &HeaderMap) -> bool {
    let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    else {
        return false;
    };

    let logins = state.logins.load(Ordering::SeqCst);
    if token == "token-1" && state.expire_first_token.load(Ordering::SeqCst) {
        return false;
    }

    token
        .strip_prefix("token-")
        .and_then(|n| n.parse::<usize>().ok())
        .is_some_and(|n| n >= 1 && n <= logins)
}

async fn stream_url(
    State(state): State<TestState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let Some(id) = params.get("id") else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let mut url = state.base_url.join("/song").unwrap();
    url.query_pairs_mut().append_pair("id", id);
    Json(json!({ "url": url })).into_response()
}

async fn search(
    State(state): State<TestState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    *state.search_max.lock().unwrap() = params.get("max").cloned();

    Json(json!({
        "entries": [
            {
                "type": "1",
                "score": 112.5,
                "track": {
                    "nid": "Tgu7iz4mjcvfxo5ouidkb6ikwoi",
                    "artist": "Daft Punk",
                    "title": "Digital Love",
                    "album": "Discovery",
                    "durationMillis": "301000"
                }
            },
            {
                "type": "3",
                "score": 95.0,
                "album": { "name": "Discovery" }
            },
            {
                "type": "1",
                "score": 80.0,
                "track": {
                    "nid": "Tzs6wcjcdwxyq3bzn2rwp4a7ehi",
                    "artist": "Daft Punk",
                    "title": "One More Time",
                    "album": "Discovery",
                    "durationMillis": 320357
                }
            }
        ]
    }))
    .into_response()
}

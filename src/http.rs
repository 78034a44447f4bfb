//! HTTP access to the gateway and the stream hosts.
//!
//! Gateway calls are throttled to stay within the gateway's quota; stream
//! downloads are not. Both share one connection pool.
//!
//! Redirects are never followed automatically: the stream fetcher inspects
//! each redirect itself, so it can bound the chain and never forward the body
//! of a redirect response.
//!
//! # Example
//!
//! ```rust
//! use songprep::http::Client;
//!
//! let client = Client::new(&config)?;
//!
//! // Throttled gateway call
//! let request = client.get_authorized(url, &token)?;
//! let response = client.execute(request).await?;
//!
//! // Stream download
//! let response = client.streaming().get(stream_url).send().await?;
//! ```

use std::{num::NonZeroU32, time::Duration};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{
    header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    redirect, Method, Request, Response,
};
use serde::Serialize;
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
};

pub struct Client {
    inner: reqwest::Client,
    throttle: DefaultDirectRateLimiter,
}

impl Client {
    /// Gateway calls allowed per [`Self::API_WINDOW`]. Calls beyond this
    /// wait for the window to roll on.
    const API_CALLS_PER_WINDOW: u32 = 50;

    const API_WINDOW: Duration = Duration::from_secs(5);

    /// How long idle connections are kept alive.
    const IDLE_KEEPALIVE: Duration = Duration::from_secs(60);

    /// Longest wait for a single read.
    ///
    /// A stalled stream surfaces as a timeout, which the stream fetcher
    /// treats like any other transport error and reconnects.
    const STALL_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a client identifying itself with the configured user agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built, for example when
    /// the TLS backend fails to initialize.
    pub fn new(config: &Config) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(redirect::Policy::none())
            .tcp_keepalive(Self::IDLE_KEEPALIVE)
            .read_timeout(Self::STALL_TIMEOUT)
            .build()?;

        let burst = NonZeroU32::new(Self::API_CALLS_PER_WINDOW)
            .ok_or_else(|| Error::internal("gateway quota allows no calls"))?;
        let quota = Quota::with_period(Self::API_WINDOW / Self::API_CALLS_PER_WINDOW)
            .ok_or_else(|| Error::internal("gateway quota window is empty"))?
            .allow_burst(burst);

        Ok(Self {
            inner,
            throttle: RateLimiter::direct(quota),
        })
    }

    /// Client for stream downloads, which are not throttled.
    #[must_use]
    pub fn streaming(&self) -> reqwest::Client {
        self.inner.clone()
    }

    /// Builds a `POST` of `body` as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if `body` cannot be serialized.
    pub fn post_json<T>(&self, url: Url, body: &T) -> Result<Request>
    where
        T: Serialize + ?Sized,
    {
        let mut request = Request::new(Method::POST, url);
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        *request.body_mut() = Some(serde_json::to_vec(body)?.into());

        Ok(request)
    }

    /// Builds a `GET` carrying `token` as bearer authorization.
    ///
    /// # Errors
    ///
    /// Returns an error if `token` cannot be put in a header.
    pub fn get_authorized(&self, url: Url, token: &str) -> Result<Request> {
        let mut request = Request::new(Method::GET, url);

        let mut authorization = HeaderValue::from_str(&format!("Bearer {token}"))?;
        authorization.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, authorization);

        Ok(request)
    }

    /// Sends a gateway request once the throttle allows it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be sent or no response was
    /// received. Unsuccessful status codes are not errors here.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.throttle.until_ready().await;
        trace!("{} {}", request.method(), request.url().path());

        self.inner.execute(request).await.map_err(Into::into)
    }
}

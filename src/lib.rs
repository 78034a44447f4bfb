//! Fetch, transcode and cache songs from a streaming music provider.
//!
//! Songs are prepared for playback by downloading their raw stream from the
//! provider and transcoding it on the fly into a local cache. Once a song is
//! cached, preparing it again costs nothing.
//!
//! # Architecture
//!
//! * [`prepare`]: entry point; one preparation per song at a time, with
//!   progress reporting and cancellation
//! * [`fetch`]: downloads raw streams, following redirects and reconnecting
//!   on network errors
//! * [`transcode`]: pipes the stream through an external encoder
//! * [`cache`]: temporary and final file locations, atomic promotion
//! * [`provider`]: what a music service must offer, implemented for an HTTP
//!   gateway in [`gateway`]
//!
//! Supporting modules: [`config`], [`credentials`], [`error`], [`events`],
//! [`http`] and [`song`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use songprep::{
//!     config::Config, credentials::Credentials, gateway::Gateway, prepare::Preparer,
//! };
//!
//! let config = Config::new("/var/cache/songprep");
//! let credentials = Credentials::from_file("credentials.toml")?;
//!
//! let gateway = Gateway::new(&config, credentials)?;
//! gateway.connect().await?;
//!
//! let preparer = Preparer::new(&config, Arc::new(gateway))?;
//! preparer.cache().create_dirs().await?;
//!
//! let id = "Tgu7iz4mjcvfxo5ouidkb6ikwoi".parse()?;
//! preparer.prepare(&id).finish().await?;
//! assert!(preparer.is_prepared(&id));
//! ```
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
extern crate log;

pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod fetch;
pub mod gateway;
pub mod http;
pub mod prepare;
pub mod provider;
pub mod song;
pub mod transcode;

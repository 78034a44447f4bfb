//! Configuration passed explicitly into every component.
//!
//! Nothing in this crate reads ambient configuration: the host constructs a
//! [`Config`] once and hands out references to it.

use std::{path::PathBuf, time::Duration};

use url::Url;

/// How the raw stream is turned into the cached format.
///
/// The program reads the original stream on standard input and writes the
/// encoded stream to standard output.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TranscoderConfig {
    /// Executable to run, looked up in `PATH` when not absolute.
    pub program: String,

    /// Arguments passed to `program`.
    pub args: Vec<String>,

    /// File extension of the cached files, without the leading dot.
    pub extension: String,
}

impl TranscoderConfig {
    /// Default codec of the cached files.
    pub const OPUS_CODEC: &'static str = "libopus";

    /// Default bitrate of the cached files in kbit/s.
    pub const OPUS_BITRATE: u32 = 192;

    /// Transcode audio to Opus at 192 kbit/s with `ffmpeg`, dropping any
    /// video track.
    #[must_use]
    pub fn opus() -> Self {
        Self::ffmpeg(Self::OPUS_CODEC, Self::OPUS_BITRATE, "opus", "opus")
    }

    /// Transcode audio with `ffmpeg` into `codec` at `bitrate` kbit/s, muxed
    /// as `format`.
    #[must_use]
    pub fn ffmpeg(codec: &str, bitrate: u32, format: &str, extension: &str) -> Self {
        let args = [
            "-hide_banner",
            "-nostdin",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-vn",
            "-c:a",
            codec,
            "-b:a",
            &format!("{bitrate}k"),
            "-f",
            format,
            "pipe:1",
        ];

        Self {
            program: "ffmpeg".to_owned(),
            args: args.iter().map(ToString::to_string).collect(),
            extension: extension.to_owned(),
        }
    }
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self::opus()
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Config {
    /// Sent with every HTTP request, gateway and stream hosts alike.
    pub user_agent: String,

    /// Base directory under which every provider keeps its cached files.
    pub cache_root: PathBuf,

    /// Maximum number of search results requested from the provider.
    pub search_result_limit: usize,

    /// Fixed delay before reconnecting after a transport error.
    pub reconnect_backoff: Duration,

    /// Maximum number of redirects followed for one resolved stream URL.
    pub max_redirects: usize,

    pub transcoder: TranscoderConfig,

    /// Base URL of the provider gateway.
    pub gateway_url: Url,
}

impl Config {
    /// Default search result limit. Providers cap this at 100.
    pub const SEARCH_RESULT_LIMIT: usize = 100;

    /// Default delay before reconnecting after a transport error.
    pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

    /// Default maximum number of redirects to follow.
    pub const MAX_REDIRECTS: usize = 5;

    /// Default gateway to resolve songs with.
    pub const GATEWAY_URL: &'static str = "http://127.0.0.1:9999/";

    /// Creates a configuration caching into `cache_root` with default
    /// settings.
    #[must_use]
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            user_agent: user_agent(),

            cache_root: cache_root.into(),
            search_result_limit: Self::SEARCH_RESULT_LIMIT,
            reconnect_backoff: Self::RECONNECT_BACKOFF,
            max_redirects: Self::MAX_REDIRECTS,
            transcoder: TranscoderConfig::default(),

            gateway_url: default_gateway_url(),
        }
    }
}

/// `songprep/<version> (Rust; <os>/<os version>)`
fn user_agent() -> String {
    // Product tokens may not contain these.
    let clean = |token: &str| token.replace(['/', ';', '(', ')'], "_");

    let os_version = sysinfo::System::os_version()
        .filter(|version| !version.is_empty())
        .unwrap_or_else(|| "unknown".to_owned());

    let user_agent = format!(
        "{}/{} (Rust; {}/{})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        clean(&os_version)
    );
    trace!("user agent: {user_agent}");

    user_agent
}

fn default_gateway_url() -> Url {
    match Url::parse(Config::GATEWAY_URL) {
        Ok(url) => url,
        Err(e) => unreachable!("{}: {e}", Config::GATEWAY_URL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opus_drops_video_and_sets_bitrate() {
        let transcoder = TranscoderConfig::opus();
        assert_eq!(transcoder.program, "ffmpeg");
        assert_eq!(transcoder.extension, "opus");

        let args = transcoder.args.join(" ");
        assert!(args.contains("-vn"));
        assert!(args.contains("-c:a libopus"));
        assert!(args.contains("-b:a 192k"));
        assert!(args.ends_with("-f opus pipe:1"));
    }

    #[test]
    fn user_agent_has_one_product_token() {
        let user_agent = user_agent();
        let (product, comment) = user_agent.split_once(' ').unwrap();

        assert_eq!(product.matches('/').count(), 1);
        assert!(comment.starts_with("(Rust; "));
        assert_eq!(comment.matches('/').count(), 1);
        assert!(comment.ends_with(')'));
    }

    #[test]
    fn defaults() {
        let config = Config::new("/tmp/cache");
        assert_eq!(config.reconnect_backoff, Duration::from_secs(5));
        assert_eq!(config.max_redirects, 5);
        assert_eq!(config.search_result_limit, 100);
        assert!(config.user_agent.starts_with("songprep/"));
        assert_eq!(config.gateway_url.as_str(), Config::GATEWAY_URL);
    }
}

use std::{error::Error, path::PathBuf, process, sync::Arc};

use clap::{command, Parser, ValueHint};
use futures_util::future::join_all;
use log::{debug, error, info, LevelFilter};
use url::Url;

use songprep::{
    config::Config,
    credentials::Credentials,
    events::Progress,
    gateway::Gateway,
    prepare::{Preparation, Preparer},
    provider::Provider,
    song::SongId,
};

/// Build flavor reported at startup.
const BUILD_PROFILE: &str = if cfg!(debug_assertions) {
    "debug"
} else {
    "release"
};

/// `--quiet` and `--verbose` cannot be combined.
const VERBOSITY: &str = "verbosity";

/// Prepares songs from the gateway into the local cache.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Song identifiers to prepare
    #[arg(value_name = "ID", required_unless_present = "search")]
    ids: Vec<SongId>,

    /// Credentials file
    ///
    /// TOML with `username` and `password`. Keep it readable by you alone.
    ///
    /// [default: credentials.toml in the platform configuration directory]
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    secrets_file: Option<PathBuf>,

    /// Cache directory
    ///
    /// Prepared songs are kept in a subdirectory per provider.
    ///
    /// [default: songprep in the platform cache directory]
    #[arg(short, long, value_name = "DIR", value_hint = ValueHint::DirPath, env = "SONGPREP_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Gateway URL
    #[arg(short, long, value_hint = ValueHint::Url, env = "SONGPREP_GATEWAY", default_value = Config::GATEWAY_URL)]
    gateway: Url,

    /// Search the catalog and print the songs found
    #[arg(long, value_name = "TERMS")]
    search: Option<String>,

    /// Only log warnings and errors
    #[arg(short, long, group = VERBOSITY)]
    quiet: bool,

    /// Log progress per song (-vv adds HTTP traffic)
    #[arg(short, long, action = clap::ArgAction::Count, group = VERBOSITY)]
    verbose: u8,
}

/// Sets up `env_logger`.
///
/// `RUST_LOG` applies unless `--quiet` or `--verbose` is given, in which case
/// those set the level of this crate's own messages. Without either, `info`
/// is the default.
///
/// # Panics
///
/// Panics if a logger was set up before.
fn init_logger(args: &Args) {
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    let mut logger = env_logger::Builder::from_env(env);

    let level = match (args.quiet, args.verbose) {
        (true, _) => Some(LevelFilter::Warn),
        (false, 0) => None,
        (false, 1) => Some(LevelFilter::Debug),
        (false, _) => Some(LevelFilter::Trace),
    };
    if let Some(level) = level {
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the gateway credentials from a file.
///
/// # Errors
///
/// Fails when no path is given and there is no platform configuration
/// directory, or when the file is missing, oversized or malformed.
fn load_credentials(secrets_file: Option<PathBuf>) -> Result<Credentials, Box<dyn Error>> {
    let secrets_file = secrets_file
        .or_else(Credentials::default_path)
        .ok_or("no secrets file specified and no configuration directory found")?;

    let credentials = Credentials::from_file(&secrets_file);
    if let Err(ref e) = credentials {
        if e.kind == songprep::error::ErrorKind::NotFound {
            info!(
                "put your username and password in {}",
                secrets_file.display()
            );
        }
    }

    Ok(credentials?)
}

/// Follows a preparation to its end, logging its progress.
///
/// Returns whether the song was prepared.
async fn follow(mut preparation: Preparation) -> bool {
    let id = preparation.id().clone();
    let mut written = 0;

    while let Some(item) = preparation.next().await {
        match item {
            Ok(Progress::Written(len)) => {
                written += len;
                debug!("song {id}: {written} bytes transcoded");
            }
            Ok(Progress::Done) => {
                info!("song {id} is ready");
                return true;
            }
            Err(e) => {
                error!("song {id}: {e}");
                return false;
            }
        }
    }

    false
}

/// Logs in, optionally searches, then prepares every requested song.
///
/// # Errors
///
/// Fails if login fails or any song could not be prepared.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let credentials = load_credentials(args.secrets_file)?;

    let cache_dir = args
        .cache_dir
        .or_else(|| dirs::cache_dir().map(|dir| dir.join(env!("CARGO_PKG_NAME"))))
        .ok_or("no cache directory specified and no platform cache directory found")?;

    let mut config = Config::new(cache_dir);
    config.gateway_url = args.gateway;

    let gateway = Arc::new(Gateway::new(&config, credentials)?);
    gateway.connect().await?;

    if let Some(terms) = args.search {
        let songs = gateway.search(&terms, config.search_result_limit).await?;
        for song in songs {
            println!(
                "{song} ({}; {}s; score {:.1})",
                song.album,
                song.duration.as_secs(),
                song.score
            );
        }
    }

    if args.ids.is_empty() {
        return Ok(());
    }

    let preparer = Preparer::new(&config, gateway)?;
    preparer.cache().create_dirs().await?;

    let preparations: Vec<_> = args.ids.iter().map(|id| preparer.prepare(id)).collect();
    let cancel_handles: Vec<_> = preparations.iter().map(Preparation::cancel_handle).collect();

    let all = join_all(preparations.into_iter().map(follow));
    tokio::pin!(all);

    let results = tokio::select! {
        biased;

        _ = tokio::signal::ctrl_c() => {
            info!("shutting down gracefully");
            for handle in &cancel_handles {
                handle.cancel();
            }

            // Wait for the temporary files to be cleaned up.
            all.await
        }

        results = &mut all => results,
    };

    let failed = results.iter().filter(|prepared| !**prepared).count();
    if failed > 0 {
        return Err(format!("{failed} of {} songs could not be prepared", results.len()).into());
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args);
    debug!("{args:#?}");

    let cmd = command!();
    info!(
        "{} {} ({BUILD_PROFILE})",
        cmd.get_name(),
        cmd.get_version().unwrap_or("unknown")
    );

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}

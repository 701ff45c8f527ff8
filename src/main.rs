mod cache;
mod config;
mod host;
mod net;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{CacheStorage, MemoryStorage, SqliteStorage};
use config::Config;
use host::Host;
use net::{HttpFetcher, Method, Request};
use worker::{CacheLifecycleManager, WorkerSettings};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline asset cache with precaching and stale-while-revalidate")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin the application is served from
  #[arg(long)]
  origin: Option<String>,

  /// Cache version; changing it rotates the bucket
  #[arg(long = "cache-version")]
  cache_version: Option<u32>,

  /// SQLite database path
  #[arg(long)]
  db: Option<PathBuf>,

  /// Keep buckets in memory for this run only
  #[arg(long)]
  ephemeral: bool,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest and delete buckets from older versions
  Install,
  /// Send requests through the worker and print what comes back
  Get {
    /// Paths relative to the origin
    #[arg(required = true)]
    paths: Vec<String>,

    /// Mark the requests as page navigations
    #[arg(long)]
    navigate: bool,

    /// Request method
    #[arg(long, default_value = "GET")]
    method: String,
  },
  /// List buckets and how many entries each holds
  Buckets,
}

/// Initialize the tracing subscriber. The guard must live until exit when
/// logging to a file.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  // RUST_LOG controls the level (e.g., RUST_LOG=swcache=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

      Ok(None)
    }
  }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_file.as_deref())?;

  // Load configuration, then apply command line overrides
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(version) = args.cache_version {
    config.cache.version = version;
  }
  if let Some(db) = args.db {
    config.storage.path = Some(db);
  }
  config.storage.ephemeral |= args.ephemeral;
  config.validate()?;

  info!(origin = %config.origin, version = config.cache.version, "swcache starting");

  if config.storage.ephemeral {
    run(args.command, &config, Arc::new(MemoryStorage::new())).await
  } else {
    let storage = match &config.storage.path {
      Some(path) => SqliteStorage::open_at(path)?,
      None => SqliteStorage::open()?,
    };
    run(args.command, &config, Arc::new(storage)).await
  }
}

async fn run<S: CacheStorage + 'static>(
  command: Command,
  config: &Config,
  storage: Arc<S>,
) -> Result<()> {
  let settings = WorkerSettings::from_config(config)?;

  match command {
    Command::Buckets => list_buckets(storage.as_ref(), &settings.bucket_name()),
    Command::Install => {
      let (worker, host) = spawn_worker(config, settings, storage)?;
      host.start().await?;

      println!(
        "{} ({}): {} entries",
        worker.bucket().name(),
        host.state().await?,
        worker.bucket().keys()?.len()
      );
      Ok(())
    }
    Command::Get {
      paths,
      navigate,
      method,
    } => {
      let method: Method = method.parse()?;
      let origin = config.origin_url()?;
      let (_worker, host) = spawn_worker(config, settings, storage)?;

      // An uninstalled worker leaves every request to the network
      if let Err(e) = host.start().await {
        eprintln!("warning: worker not active: {}", e);
      }

      for path in paths {
        let url = origin
          .join(&path)
          .map_err(|e| eyre!("Invalid path '{}': {}", path, e))?;
        let request = if navigate {
          Request::navigate(url)
        } else {
          Request::get(url)
        }
        .with_method(method);

        let label = request.to_string();
        match host.fetch(request).await {
          Ok(response) => println!(
            "{} {:<20} {:>8} bytes  {:<24} {}",
            response.status,
            response.status_text,
            response.body.len(),
            response.header("content-type").unwrap_or("-"),
            label
          ),
          Err(e) => println!("ERR {}: {}", label, e),
        }
      }
      Ok(())
    }
  }
}

type HttpWorker<S> = CacheLifecycleManager<S, HttpFetcher>;

/// Build the worker over real HTTP and start a host loop for it.
fn spawn_worker<S: CacheStorage + 'static>(
  config: &Config,
  settings: WorkerSettings,
  storage: Arc<S>,
) -> Result<(Arc<HttpWorker<S>>, Host)> {
  let network = Arc::new(HttpFetcher::new(&config.user_agent)?);
  let worker = Arc::new(CacheLifecycleManager::new(
    settings,
    storage,
    Arc::clone(&network),
  ));
  let host = Host::spawn(Arc::clone(&worker), network);

  Ok((worker, host))
}

fn list_buckets<S: CacheStorage>(storage: &S, current: &str) -> Result<()> {
  let names = storage.bucket_names()?;
  if names.is_empty() {
    println!("No buckets");
    return Ok(());
  }

  for name in names {
    let marker = if name == current { "*" } else { " " };
    println!("{} {:<32} {} entries", marker, name, storage.keys(&name)?.len());
  }

  Ok(())
}

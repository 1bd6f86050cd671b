use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use xlsync::cache::CacheSource;
use xlsync::config::Config;
use xlsync::offline::{
  Connectivity, ConnectivityMonitor, LogNotifier, ReplayFlusher, SyncManager, SyncOutcome,
};
use xlsync::store::{KeyValueStore, SqliteStore};
use xlsync::transport::{ProgressFn, ReqwestTransport};
use xlsync::upload::{UploadFile, UploadOptions};
use xlsync::{ApiClient, Method, RequestOptions};

#[derive(Parser, Debug)]
#[command(name = "xlsync")]
#[command(about = "Resilient command-line client for the Excel AI backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/xlsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the rolling log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send a request and print the JSON response
  Request {
    /// GET, POST, PUT, PATCH or DELETE
    method: String,
    /// Path relative to the base URL, e.g. /v1/health
    path: String,
    /// Query parameter as key=value (repeatable)
    #[arg(short, long = "param")]
    params: Vec<String>,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
    /// Skip the response cache
    #[arg(long)]
    no_cache: bool,
  },
  /// Upload a spreadsheet or image
  Upload {
    file: PathBuf,
    /// Upload endpoint (default: /v1/excel/upload)
    #[arg(long)]
    endpoint: Option<String>,
  },
  /// Fetch the health and profile endpoints
  Preload,
  /// Manage the stored bearer token
  Token {
    #[command(subcommand)]
    action: TokenAction,
  },
  /// Inspect and sync the offline queue
  Offline {
    #[command(subcommand)]
    action: OfflineAction,
  },
  /// Watch connectivity and sync the offline queue on reconnect
  Watch,
}

#[derive(Subcommand, Debug)]
enum TokenAction {
  Set { token: String },
  Clear,
}

#[derive(Subcommand, Debug)]
enum OfflineAction {
  /// Persist a JSON value for a later sync
  Save { key: String, data: String },
  Get { key: String },
  List,
  /// Replay pending records now
  Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.log_stderr)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let store: Arc<dyn KeyValueStore> = Arc::new(match &config.storage.path {
    Some(path) => SqliteStore::open_at(path)?,
    None => SqliteStore::open()?,
  });
  let transport = Arc::new(ReqwestTransport::new()?);
  let client = ApiClient::new(config.client_settings(), transport, Arc::clone(&store));

  match args.command {
    Command::Request {
      method,
      path,
      params,
      body,
      no_cache,
    } => {
      let mut options = RequestOptions::new(method.parse::<Method>()?, path);
      if !params.is_empty() {
        options.params = Some(parse_params(&params)?);
      }
      if let Some(body) = body {
        options.body = Some(serde_json::from_str(&body).map_err(|e| eyre!("Invalid JSON body: {}", e))?);
      }
      options.no_cache = no_cache;

      let result = client.fetch(options).await?;
      if result.source == CacheSource::Cache {
        tracing::info!("Served from cache");
      }
      println!("{}", serde_json::to_string_pretty(&result.data)?);
    }
    Command::Upload { file, endpoint } => {
      let file = UploadFile::from_path(&file).await?;
      let progress: ProgressFn = Arc::new(|percent: u8| eprint!("\rUploading... {:>3}%", percent));
      let response = client
        .upload_file(file, Some(progress), UploadOptions { endpoint })
        .await;
      eprintln!();
      println!("{}", serde_json::to_string_pretty(&response?)?);
    }
    Command::Preload => {
      client.preload_critical_data().await;
    }
    Command::Token { action } => match action {
      TokenAction::Set { token } => client.set_auth_token(&token)?,
      TokenAction::Clear => client.clear_auth_token()?,
    },
    Command::Offline { action } => {
      let manager = sync_manager(&client, Connectivity::default());
      match action {
        OfflineAction::Save { key, data } => {
          let data: Value = serde_json::from_str(&data).unwrap_or(Value::String(data));
          manager.save_offline_data(&key, data);
        }
        OfflineAction::Get { key } => match manager.get_offline_data(&key) {
          Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
          None => return Err(eyre!("No offline data stored under '{}'", key)),
        },
        OfflineAction::List => {
          for record in manager.pending_records()? {
            println!("{}\t{}\t{}", record.timestamp.to_rfc3339(), record.key, record.data);
          }
        }
        OfflineAction::Sync => match manager.sync_pending_data().await? {
          SyncOutcome::Empty => println!("Nothing to sync"),
          SyncOutcome::Skipped => println!("Sync already in progress"),
          SyncOutcome::Synced(n) => println!("Synced {} record(s)", n),
        },
      }
    }
    Command::Watch => {
      let connectivity = Connectivity::default();
      let client = client.with_connectivity(connectivity.clone());
      let manager = sync_manager(&client, connectivity.clone());

      let (tx, rx) = mpsc::unbounded_channel();
      let monitor = ConnectivityMonitor::new(
        Arc::clone(client.executor()),
        Duration::from_secs(config.connectivity.probe_interval_secs),
        Duration::from_secs(config.connectivity.probe_timeout_secs),
      )
      .spawn(connectivity, tx);

      client.preload_critical_data().await;
      tracing::info!("Watching connectivity");

      tokio::select! {
        _ = manager.run(rx) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
      }
      monitor.abort();
    }
  }

  Ok(())
}

fn sync_manager(client: &ApiClient, connectivity: Connectivity) -> SyncManager {
  let flusher = Arc::new(ReplayFlusher::new(
    Arc::clone(client.executor()),
    client.retry_policy().clone(),
  ));
  SyncManager::new(client.offline_queue(), flusher, Arc::new(LogNotifier), connectivity)
}

/// `key=value` pairs into a JSON object. Values that parse as JSON keep their
/// type; anything else is a string.
fn parse_params(pairs: &[String]) -> Result<Value> {
  let mut map = Map::new();
  for pair in pairs {
    let (key, value) = pair
      .split_once('=')
      .ok_or_else(|| eyre!("Invalid parameter '{}', expected key=value", pair))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    map.insert(key.to_string(), value);
  }
  Ok(Value::Object(map))
}

fn init_logging(to_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xlsync=info"));

  if to_stderr {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("xlsync")
    .join("logs");
  let appender = tracing_appender::rolling::daily(log_dir, "xlsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}

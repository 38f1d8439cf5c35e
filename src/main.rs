use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use pondwatch::cache::storage::storage_namespace;
use pondwatch::cache::{CacheDeps, CacheEvent, CacheTopic, KeyValueStore, MemoryStorage, NoopStorage, SqliteStorage};
use pondwatch::clock::SystemClock;
use pondwatch::config::{CacheSettings, Config, StorageKind};
use pondwatch::farm::FarmCache;
use pondwatch::realtime::{SyncBridge, WsRealtime};
use pondwatch::sound::{SoundHook, TerminalBell};
use pondwatch::transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "pondwatch")]
#[command(about = "Keeps a local cache of a fish-farm backend in sync over its push channel")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pondwatch/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Fetch every list once, print a summary and exit
  #[arg(long)]
  once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging()?;

  let token = match Config::get_api_token() {
    Ok(token) => Some(token),
    Err(e) => {
      warn!("{}", e);
      None
    }
  };

  let transport = HttpTransport::new(&config.api, token.clone())?;
  let deps = CacheDeps {
    transport: Arc::new(transport),
    storage: open_storage(&config.cache)?,
    clock: Arc::new(SystemClock),
    namespace: storage_namespace(&config.api.base_url),
  };
  let clock = deps.clock.clone();

  let farm = FarmCache::new(deps, &config.cache, config.api.user_id.clone());
  for error in farm.fetch_all(false).await {
    eprintln!("warning: {}", error);
  }
  println!("{}", farm.summary());

  if args.once {
    return Ok(());
  }

  let realtime = Arc::new(WsRealtime::new(config.api.realtime_url()?, token));
  let bridge = SyncBridge::new(realtime.clone());
  let mut subscriptions = vec![farm.attach(&bridge)];

  if config.sound.enabled {
    let hook = SoundHook::new(
      Arc::new(TerminalBell),
      clock,
      chrono::Duration::milliseconds(config.sound.min_interval_ms as i64),
    );
    subscriptions.push(hook.attach(&farm));
  }

  subscriptions.push(bridge.on_connection_change(|state| info!(%state, "connection")));
  subscriptions.push(farm.alerts.cache().on_change(CacheTopic::NewItem, |event| {
    if let CacheEvent::NewItem(alert) = event {
      println!("[{}] {}", alert.severity, alert.title);
    }
  }));
  subscriptions.push(farm.notifications.cache().on_change(CacheTopic::NewItem, |event| {
    if let CacheEvent::NewItem(notification) = event {
      println!("[notice] {}", notification.title);
    }
  }));

  bridge.start().await?;
  info!("watching for changes, press Ctrl-C to stop");

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  for subscription in subscriptions {
    subscription.unsubscribe();
  }
  realtime.shutdown();
  println!("{}", farm.summary());

  Ok(())
}

fn open_storage(settings: &CacheSettings) -> Result<Arc<dyn KeyValueStore>> {
  Ok(match settings.storage {
    StorageKind::Sqlite => match &settings.path {
      Some(path) => Arc::new(SqliteStorage::open_at(path)?),
      None => Arc::new(SqliteStorage::open()?),
    },
    StorageKind::Memory => Arc::new(MemoryStorage::new()),
    StorageKind::None => Arc::new(NoopStorage),
  })
}

/// Log to a daily file under the data directory; stdout is left for the
/// summary.
fn init_logging() -> Result<WorkerGuard> {
  let dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("pondwatch")
    .join("logs");
  std::fs::create_dir_all(&dir).map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::daily(&dir, "pondwatch.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pondwatch=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

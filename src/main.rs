use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use catalog_lineage::config::{AppConfig, LogConfig, QueueMode, StoreBackend};
use catalog_lineage::connectors::ConnectorRegistry;
use catalog_lineage::db::{create_pool, PgStore};
use catalog_lineage::handlers::AppState;
use catalog_lineage::ingest::{
    run_queue_worker, InlineSubmitter, Orchestrator, QueueSubmitter, RetryPolicy, ScanRunner,
    TaskSubmitter,
};
use catalog_lineage::server::start_server;
use catalog_lineage::store::{CatalogStore, MemoryStore};

const LOG_FILE: &str = "catalog_lineage.log";

#[actix_web::main]
async fn main() -> io::Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();

    if take_flag(&mut args, &["--cli"]) {
        run_cli_mode(args);
        Ok(())
    } else {
        run_server_mode().await
    }
}

fn take_flag(args: &mut Vec<String>, names: &[&str]) -> bool {
    match args.iter().position(|a| names.contains(&a.as_str())) {
        Some(pos) => {
            args.remove(pos);
            true
        }
        None => false,
    }
}

async fn run_server_mode() -> io::Result<()> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = AppConfig::from_file(&config_path).map_err(io::Error::other)?;

    let log_state = init_logging(&config.logging).map_err(io::Error::other)?;
    start_log_maintenance(log_state);

    tracing::info!("Loaded configuration from {}", config_path);

    let registry = Arc::new(ConnectorRegistry::from_config(&config.connectors));
    tracing::info!("Registered connectors: {}", registry.keys().join(", "));

    match config.database.backend {
        StoreBackend::Postgres => {
            let pool_size = config.database.pool_size as u32;
            let pool = create_pool(&config.database_url(), pool_size).map_err(io::Error::other)?;
            tracing::info!(
                "Database connection pool created with max_size={}",
                pool_size
            );
            // Schema is managed with the diesel CLI: `diesel migration run`
            serve(Arc::new(PgStore::new(pool)), &config, registry).await
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory catalog store; data is lost on exit");
            serve(Arc::new(MemoryStore::new()), &config, registry).await
        }
    }
}

async fn serve<S: CatalogStore>(
    store: Arc<S>,
    config: &AppConfig,
    registry: Arc<ConnectorRegistry>,
) -> io::Result<()> {
    let runner = Arc::new(ScanRunner::new(store.clone(), registry));
    let policy = RetryPolicy::from_config(&config.queue);

    let submitter: Arc<dyn TaskSubmitter> = match config.queue.mode {
        QueueMode::Async => {
            let (submitter, rx) = QueueSubmitter::channel();
            actix_web::rt::spawn(run_queue_worker(rx, runner, policy));
            Arc::new(submitter)
        }
        QueueMode::Inline => Arc::new(InlineSubmitter::new(runner, policy)),
    };
    tracing::info!(
        "Scan queue mode={:?} max_retries={} retry_delay={:?}",
        config.queue.mode,
        policy.max_retries,
        policy.delay
    );

    let orchestrator = Orchestrator::new(store.clone(), submitter);
    start_server(
        &config.server.host,
        config.server.port,
        config.server.worker_threads,
        AppState::new(store, orchestrator),
    )
    .await
}

fn init_logging(config: &LogConfig) -> anyhow::Result<Arc<Mutex<RotatingLog>>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let log = RotatingLog::open(Path::new(&config.log_dir), config.max_log_files)?;
    prune_archives(&log.dir, log.max_files)?;
    let state = Arc::new(Mutex::new(log));

    let (non_blocking, guard) = tracing_appender::non_blocking(LogWriter {
        state: state.clone(),
    });

    let level = config
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(io::stdout))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    // The writer thread must outlive every log call.
    std::mem::forget(guard);

    Ok(state)
}

/// Active log file that rolls over to a dated, gzipped archive each day.
struct RotatingLog {
    dir: PathBuf,
    active: PathBuf,
    file: File,
    day: chrono::NaiveDate,
    max_files: usize,
}

impl RotatingLog {
    fn open(dir: &Path, max_files: usize) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)?;
        let active = dir.join(LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&active)?;

        // A non-empty file left by an earlier run belongs to the day it was last written.
        let meta = fs::metadata(&active)?;
        let day = match meta.modified() {
            Ok(modified) if meta.len() > 0 => {
                chrono::DateTime::<chrono::Local>::from(modified).date_naive()
            }
            _ => chrono::Local::now().date_naive(),
        };

        let mut log = Self {
            dir: dir.to_path_buf(),
            active,
            file,
            day,
            max_files,
        };
        log.roll_if_stale()?;
        Ok(log)
    }

    fn roll_if_stale(&mut self) -> anyhow::Result<()> {
        let today = chrono::Local::now().date_naive();
        if today == self.day {
            return Ok(());
        }
        self.file.flush()?;
        if self.active.exists() {
            let archive = self
                .dir
                .join(format!("{}.{}", LOG_FILE, self.day.format("%Y-%m-%d")));
            fs::rename(&self.active, &archive)?;
            gzip_file(&archive)?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active)?;
        self.day = today;
        prune_archives(&self.dir, self.max_files)
    }
}

struct LogWriter {
    state: Arc<Mutex<RotatingLog>>,
}

impl LogWriter {
    fn with_log<T>(&self, f: impl FnOnce(&mut RotatingLog) -> io::Result<T>) -> io::Result<T> {
        let mut log = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log writer poisoned"))?;
        f(&mut log)
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_log(|log| {
            log.roll_if_stale().map_err(io::Error::other)?;
            log.file.write(buf)
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_log(|log| log.file.flush())
    }
}

/// Compresses stray dated logs and keeps only the newest `max_files` archives.
fn prune_archives(dir: &Path, max_files: usize) -> anyhow::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let prefix = format!("{}.", LOG_FILE);

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(&prefix) && !name.ends_with(".gz") {
            if let Err(e) = gzip_file(&path) {
                eprintln!("Failed to compress log file {:?}: {}", path, e);
            }
        }
    }

    let mut archives: Vec<(PathBuf, std::time::SystemTime)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((entry.path(), modified))
        })
        .collect();
    archives.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in archives.iter().skip(max_files) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to remove old log file {:?}: {}", path, e);
        }
    }
    Ok(())
}

fn gzip_file(path: &Path) -> anyhow::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut gz_path = path.as_os_str().to_owned();
    gz_path.push(".gz");

    let mut input = File::open(path)?;
    let mut encoder = GzEncoder::new(File::create(&gz_path)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;

    fs::remove_file(path)?;
    Ok(())
}

fn start_log_maintenance(state: Arc<Mutex<RotatingLog>>) {
    use tokio::time::{sleep, Duration};

    actix_web::rt::spawn(async move {
        loop {
            sleep(Duration::from_secs(60)).await;
            let mut log = match state.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::warn!("Log writer state poisoned");
                    continue;
                }
            };
            if let Err(e) = log.roll_if_stale() {
                tracing::warn!("Failed to rotate active log file: {}", e);
            }
        }
    });
}

/// `--cli [--pretty] [FILE...|-]`: print the tables each input reads and writes.
fn run_cli_mode(mut args: Vec<String>) {
    let pretty = take_flag(&mut args, &["--pretty", "-p"]);

    if args.is_empty() || (args.len() == 1 && args[0] == "-") {
        let mut buf = String::new();
        if let Err(e) = io::stdin().read_to_string(&mut buf) {
            eprintln!("Failed to read stdin: {}", e);
            std::process::exit(2);
        }
        if let Err(e) = print_table_refs(&buf, pretty) {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    for path in &args {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                eprintln!("Failed to read {}: {}", path, e);
                std::process::exit(2);
            }
        };
        if let Err(e) = print_table_refs(&contents, pretty) {
            eprintln!("Error in {}: {}", path, e);
            std::process::exit(1);
        }
    }
}

fn print_table_refs(sql: &str, pretty: bool) -> anyhow::Result<()> {
    let refs = catalog_lineage::try_extract_table_refs(sql)?;
    let out = if pretty {
        serde_json::to_string_pretty(&refs)?
    } else {
        serde_json::to_string(&refs)?
    };
    println!("{}", out);
    Ok(())
}

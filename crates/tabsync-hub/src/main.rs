mod hub;

use clap::Parser;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tabsync_core::snapshot::SnapshotFile;
use tabsync_core::sync_ipc::{default_hub_addr, resolve_session_id, DEFAULT_MAX_FRAME_BYTES};
use tabsync_core::StateStore;
use tracing::{error, info};
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

use crate::hub::{router, HubConfig, HubState, Persister};

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    session_id: String,
    state_file: PathBuf,
    persist_debounce: Duration,
    hub: HubConfig,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "tabsync-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    session: String,
    #[arg(long, default_value = "")]
    state_file: String,
    #[arg(long, default_value_t = 500)]
    persist_debounce_ms: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        return;
    }

    let file = SnapshotFile::new(&config.state_file);
    let store = Arc::new(StateStore::from_state(file.load_or_initial()));
    let persister = Persister::new(store.clone(), file);
    let persist_task = persister.clone().spawn(config.persist_debounce);

    let hub = Arc::new(HubState::new(config.hub.clone(), store));
    let app = router(hub);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        session_id = %config.session_id,
        addr = %config.addr,
        state_file = %config.state_file.display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }

    persist_task.abort();
    match persister.save_now().await {
        Ok(()) => info!(event = "hub_stop", state_file = %config.state_file.display()),
        Err(err) => error!(event = "state_persist_failed", error = %err),
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    let mut session_id = args.session.clone();
    if session_id.is_empty() {
        session_id = resolve_session_id();
    }
    let addr = resolve_addr(&session_id, &args.addr);
    let debug = args.debug || env_flag("TABSYNC_HUB_DEBUG");
    let log_dir = resolve_log_dir(&args.log_dir);
    let state_file = resolve_state_file(&session_id, &args.state_file);
    Config {
        addr,
        session_id: session_id.clone(),
        state_file,
        persist_debounce: Duration::from_millis(args.persist_debounce_ms),
        hub: HubConfig {
            session_id,
            debug,
            ping_interval: Duration::from_secs(args.ping_interval),
            write_timeout: Duration::from_secs(args.write_timeout),
            queue_capacity: args.queue_capacity,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        },
        log_dir,
    }
}

/// Installs the global subscriber. Output goes to stdout and, when a log
/// directory is configured, to `tabsync-hub-<session>.log` inside it.
fn init_logging(config: &Config) {
    let default_level = if config.hub.debug {
        "debug".to_string()
    } else {
        env_value("TABSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string())
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let log = match SessionLog::open(&config.log_dir, &config.session_id) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            SessionLog::stdout_only()
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log)
        .try_init();
}

/// Stdout plus an optional append-only session log file. The subscriber
/// owns it, so the file stays open for the life of the process.
#[derive(Clone)]
struct SessionLog {
    file: Option<Arc<Mutex<File>>>,
}

impl SessionLog {
    fn stdout_only() -> Self {
        Self { file: None }
    }

    fn open(log_dir: &str, session_id: &str) -> io::Result<Self> {
        if log_dir.trim().is_empty() {
            return Ok(Self::stdout_only());
        }
        let dir = Path::new(log_dir);
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("tabsync-hub-{session_id}.log")))?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    fn with_file(&self, write: impl FnOnce(&mut File) -> io::Result<()>) {
        if let Some(mut file) = self.file.as_ref().and_then(|file| file.lock().ok()) {
            let _ = write(&mut file);
        }
    }
}

impl Write for SessionLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().lock().write_all(buf);
        self.with_file(|file| file.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().lock().flush();
        self.with_file(|file| file.flush());
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SessionLog {
    type Writer = SessionLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    env_value(key).is_some_and(|value| is_truthy(&value))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// A non-empty flag wins, then the environment variable.
fn flag_or_env(flag: &str, key: &str) -> Option<String> {
    Some(flag.trim())
        .filter(|flag| !flag.is_empty())
        .map(str::to_string)
        .or_else(|| env_value(key))
}

fn resolve_addr(session_id: &str, addr_flag: &str) -> String {
    flag_or_env(addr_flag, "TABSYNC_HUB_ADDR").unwrap_or_else(|| default_hub_addr(session_id))
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    flag_or_env(log_dir_flag, "TABSYNC_LOG_DIR").unwrap_or_default()
}

/// Flag, then `TABSYNC_STATE_FILE`, then `<data dir>/tabsync/<session>/state.json`.
fn resolve_state_file(session_id: &str, state_file_flag: &str) -> PathBuf {
    if let Some(value) = flag_or_env(state_file_flag, "TABSYNC_STATE_FILE") {
        return PathBuf::from(value);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".tabsync"))
        .join("tabsync")
        .join(session_id)
        .join("state.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_flags_win_over_derived_defaults() {
        assert_eq!(resolve_addr("s1", "127.0.0.1:9000"), "127.0.0.1:9000");
        assert_eq!(
            resolve_state_file("s1", "/tmp/custom.json"),
            PathBuf::from("/tmp/custom.json")
        );
        assert_eq!(resolve_log_dir("/tmp/logs"), "/tmp/logs");
    }

    #[test]
    fn derived_state_file_is_scoped_by_session() {
        if std::env::var("TABSYNC_STATE_FILE").is_ok() {
            return;
        }
        let path = resolve_state_file("session-42", "");
        assert!(path.ends_with("tabsync/session-42/state.json"));
    }

    #[test]
    fn truthy_values_are_case_insensitive() {
        assert!(is_truthy(" TRUE "));
        assert!(is_truthy("on"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("enabled"));
    }

    #[test]
    fn session_log_appends_to_a_per_session_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        let log_dir = log_dir.to_str().expect("utf8 path");
        let mut log = SessionLog::open(log_dir, "s7").expect("open");
        log.write_all(b"first\n").expect("write");
        let mut again = SessionLog::open(log_dir, "s7").expect("reopen");
        again.write_all(b"second\n").expect("write");
        again.flush().expect("flush");

        let written = std::fs::read_to_string(Path::new(log_dir).join("tabsync-hub-s7.log"))
            .expect("log file");
        assert_eq!(written, "first\nsecond\n");
        assert!(SessionLog::open("  ", "s7").expect("blank").file.is_none());
    }
}

use clap::Parser;
use pilot_hub::config::{Args, Config, LOG_FILE_NAME};
use pilot_hub::{create_app, AppState};
use pilot_storage::Store;
use std::{
    fs::{File, OpenOptions},
    io,
    net::SocketAddr,
    path::Path,
    sync::Mutex,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[tokio::main]
async fn main() {
    let config = Config::from_args(Args::parse());
    init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", reason = "not loopback", addr = %config.addr);
        return;
    }

    let db_path = match pilot_core::config::resolve_db_path(config.db.as_deref()) {
        Ok(path) => path,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };
    let store = match Store::open(&db_path) {
        Ok(store) => store,
        Err(err) => {
            error!(event = "hub_error", error = %err, db = %db_path.display());
            return;
        }
    };

    let app = create_app(AppState::new(store));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(event = "hub_start", addr = %config.addr, db = %db_path.display());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_stop");
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

/// Events go to stdout and, when a log directory is configured, to a plain-text
/// file in it.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));
    let file_layer = match open_log_file(&config.log_dir) {
        Ok(file) => file.map(|file| fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let _ = Registry::default()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init();
}

fn open_log_file(log_dir: &str) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = Path::new(log_dir);
    std::fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))
        .map(Some)
}

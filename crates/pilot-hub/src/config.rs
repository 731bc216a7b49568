use clap::Parser;
use pilot_core::config::{env_non_empty, env_true};
use std::path::PathBuf;

pub const DEFAULT_ADDR: &str = "127.0.0.1:4710";
pub const DEFAULT_LOG_DIR: &str = ".pilot/logs";
pub const LOG_FILE_NAME: &str = "pilot-hub.log";

#[derive(Parser, Debug, Default)]
#[command(name = "pilot-hub")]
#[command(about = "HTTP front for the task queue, dead-letter store and metrics", long_about = None)]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long)]
    pub db: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub db: Option<PathBuf>,
    pub debug: bool,
    pub log_dir: String,
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        Self {
            addr: resolve_addr(&args.addr, env_non_empty("PILOT_HUB_ADDR")),
            db: args.db,
            debug: args.debug || env_true("PILOT_HUB_DEBUG"),
            log_dir: resolve_log_dir(&args.log_dir, env_non_empty("PILOT_LOG_DIR")),
        }
    }

    pub fn log_level(&self) -> String {
        if self.debug {
            return "debug".to_string();
        }
        env_non_empty("PILOT_LOG_LEVEL").unwrap_or_else(|| "info".to_string())
    }
}

pub fn resolve_addr(addr_flag: &str, env_value: Option<String>) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    env_value.unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

pub fn resolve_log_dir(log_dir_flag: &str, env_value: Option<String>) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_value.unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())
}

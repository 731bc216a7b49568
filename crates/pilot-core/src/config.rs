use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DB_FILE_NAME: &str = "pilot.db";
pub const APP_DIR_NAME: &str = "pilot";

pub const ENV_DB_PATH: &str = "PILOT_DB_PATH";
pub const ENV_DATA_DIR: &str = "PILOT_DATA_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot determine a data directory; set PILOT_DATA_DIR or PILOT_DB_PATH")]
    NoDataDir,
    #[error("failed to create {}: {}", .path.display(), .source)]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves the store file shared by the hub and the CLI, creating its parent
/// directory: `--db` flag, then `PILOT_DB_PATH`, then `PILOT_DATA_DIR/pilot.db`,
/// then the platform data directory.
pub fn resolve_db_path(flag: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = pick_db_path(
        flag,
        env_non_empty(ENV_DB_PATH),
        env_non_empty(ENV_DATA_DIR),
        dirs::data_local_dir(),
    )?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(path)
}

fn pick_db_path(
    flag: Option<&Path>,
    db_env: Option<String>,
    data_dir_env: Option<String>,
    platform_dir: Option<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    if let Some(flag) = flag.filter(|flag| !flag.as_os_str().is_empty()) {
        return Ok(flag.to_path_buf());
    }
    if let Some(path) = db_env {
        return Ok(PathBuf::from(path));
    }
    if let Some(dir) = data_dir_env {
        return Ok(PathBuf::from(dir).join(DB_FILE_NAME));
    }
    platform_dir
        .map(|dir| dir.join(APP_DIR_NAME).join(DB_FILE_NAME))
        .ok_or(ConfigError::NoDataDir)
}

pub fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_environment() {
        let path = pick_db_path(
            Some(Path::new("/tmp/flag.db")),
            Some("/tmp/env.db".to_string()),
            Some("/tmp/data".to_string()),
            Some(PathBuf::from("/home/me/.local/share")),
        )
        .expect("path");
        assert_eq!(path, PathBuf::from("/tmp/flag.db"));
    }

    #[test]
    fn data_dir_env_gets_default_file_name() {
        let path = pick_db_path(None, None, Some("/tmp/data".to_string()), None).expect("path");
        assert_eq!(path, PathBuf::from("/tmp/data/pilot.db"));
    }

    #[test]
    fn platform_dir_is_namespaced() {
        let path = pick_db_path(None, None, None, Some(PathBuf::from("/home/me/.local/share")))
            .expect("path");
        assert_eq!(path, PathBuf::from("/home/me/.local/share/pilot/pilot.db"));
    }

    #[test]
    fn missing_everything_is_an_error() {
        assert!(matches!(
            pick_db_path(Some(Path::new("")), None, None, None),
            Err(ConfigError::NoDataDir)
        ));
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub config_dir: PathBuf,
    pub db_path: PathBuf,
    pub restic_config: PathBuf,
    pub log_level: String,
    pub cache_refresh: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let base = executable_dir();
        let dir_var = |key: &str, default: &str| {
            std::env::var_os(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join(default))
        };

        let data_dir = dir_var("DATA_DIR", "data");
        let config_dir = dir_var("CONFIG_DIR", "config");

        Self {
            bin_dir: dir_var("BIN_DIR", "bin"),
            db_path: data_dir.join("archive.sqlite"),
            restic_config: config_dir.join("restic.toml"),
            data_dir,
            config_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            cache_refresh: Duration::from_secs(
                std::env::var("CACHE_REFRESH_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(300),
            ),
        }
    }

    /// Create the data, bin and config directories
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.data_dir, &self.bin_dir, &self.config_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Directory of the running executable with symlinks resolved, or `.`
fn executable_dir() -> PathBuf {
    std::env::current_exe()
        .and_then(|exe| exe.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

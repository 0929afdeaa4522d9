//! Restic settings: binary location, repository, credential and cache directory.
//!
//! Loaded from a TOML file with `RESTIC_AGENT_*` environment variable overrides.
//! The file is created with defaults (and a freshly generated repository password)
//! the first time it is opened.

use crate::utils::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Name of the restic executable inside `bin_dir`
#[cfg(windows)]
pub const RESTIC_BINARY: &str = "restic.exe";
#[cfg(not(windows))]
pub const RESTIC_BINARY: &str = "restic";

/// Environment prefix for overrides (e.g. `RESTIC_AGENT_PASSWORD`)
const ENV_PREFIX: &str = "RESTIC_AGENT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResticSettings {
    /// Directory holding the restic executable
    pub bin_dir: PathBuf,

    /// Repository location (`RESTIC_REPOSITORY`)
    pub repository: PathBuf,

    /// Local cache directory (`RESTIC_CACHE_DIR`)
    pub cache_dir: PathBuf,

    /// Repository password (`RESTIC_PASSWORD`)
    #[serde(default)]
    pub password: String,
}

impl ResticSettings {
    /// Default layout: `<data_dir>/restic/repo` and `<data_dir>/restic/cache`.
    pub fn with_data_dir(data_dir: &Path, bin_dir: &Path) -> Self {
        Self {
            bin_dir: bin_dir.to_path_buf(),
            repository: data_dir.join("restic").join("repo"),
            cache_dir: data_dir.join("restic").join("cache"),
            password: generate_password(),
        }
    }

    /// Full path of the restic executable
    pub fn binary(&self) -> PathBuf {
        self.bin_dir.join(RESTIC_BINARY)
    }

    /// Load settings from `path`, writing `defaults` there first if the file is missing.
    ///
    /// A file without a password gets one generated and written back.
    pub fn load_or_init(path: &Path, defaults: &ResticSettings) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_settings(path, defaults)?;
            tracing::info!(path = %path.display(), "Created restic settings file");
        }

        let mut settings = read_settings(path)?;
        if settings.password.is_empty() {
            tracing::warn!(path = %path.display(), "Restic password missing, generating a new one");
            settings.password = generate_password();
            write_settings(path, &settings)?;
        }

        Ok(settings)
    }
}

fn read_settings(path: &Path) -> Result<ResticSettings> {
    let source = path.to_string_lossy();
    let settings = config::Config::builder()
        .add_source(config::File::new(&source, config::FileFormat::Toml))
        .add_source(config::Environment::with_prefix(ENV_PREFIX))
        .build()?
        .try_deserialize::<ResticSettings>()?;
    Ok(settings)
}

fn write_settings(path: &Path, settings: &ResticSettings) -> Result<()> {
    let content = toml::to_string_pretty(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Generate a high-entropy repository password (two random v4 UUIDs, hex encoded).
pub fn generate_password() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Settings shared between the command builder and whoever reloads the file.
///
/// Readers take the shared lock only long enough to copy what they need.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    path: Option<PathBuf>,
    inner: Arc<RwLock<ResticSettings>>,
}

impl SharedSettings {
    /// Open (or create) the settings file at `path`
    pub fn open(path: &Path, defaults: &ResticSettings) -> Result<Self> {
        let settings = ResticSettings::load_or_init(path, defaults)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            inner: Arc::new(RwLock::new(settings)),
        })
    }

    /// In-memory settings with no backing file (reload is a no-op)
    pub fn fixed(settings: ResticSettings) -> Self {
        Self {
            path: None,
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Run `f` against the current settings under the shared lock
    pub fn read<R>(&self, f: impl FnOnce(&ResticSettings) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Copy of the current settings
    pub fn snapshot(&self) -> ResticSettings {
        self.read(Clone::clone)
    }

    /// Re-read the backing file and swap the in-memory settings
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Err(AgentError::Config(format!(
                "settings file {} disappeared",
                path.display()
            )));
        }
        let fresh = read_settings(path)?;
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = fresh;
        tracing::info!(path = %path.display(), "Reloaded restic settings");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn defaults(dir: &Path) -> ResticSettings {
        ResticSettings::with_data_dir(&dir.join("data"), &dir.join("bin"))
    }

    #[test]
    fn test_generate_password_is_long_and_unique() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_default_layout() {
        let settings = ResticSettings::with_data_dir(Path::new("/srv/data"), Path::new("/srv/bin"));
        assert_eq!(settings.repository, PathBuf::from("/srv/data/restic/repo"));
        assert_eq!(settings.cache_dir, PathBuf::from("/srv/data/restic/cache"));
        assert_eq!(settings.binary(), PathBuf::from("/srv/bin").join(RESTIC_BINARY));
    }

    #[test]
    fn test_load_or_init_creates_file_once() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config").join("restic.toml");
        let defaults = defaults(temp_dir.path());

        let first = ResticSettings::load_or_init(&path, &defaults)?;
        assert!(path.exists());
        assert_eq!(first.password, defaults.password);

        // A second open must keep the persisted password, not generate a new one
        let other_defaults = ResticSettings::with_data_dir(temp_dir.path(), temp_dir.path());
        let second = ResticSettings::load_or_init(&path, &other_defaults)?;
        assert_eq!(second.password, first.password);
        assert_eq!(second.repository, first.repository);
        Ok(())
    }

    #[test]
    fn test_missing_password_is_generated_and_persisted() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("restic.toml");
        std::fs::write(
            &path,
            "bin_dir = \"/opt/bin\"\nrepository = \"/opt/repo\"\ncache_dir = \"/opt/cache\"\n",
        )?;

        let settings = ResticSettings::load_or_init(&path, &defaults(temp_dir.path()))?;
        assert_eq!(settings.password.len(), 64);

        let reread = ResticSettings::load_or_init(&path, &defaults(temp_dir.path()))?;
        assert_eq!(reread.password, settings.password);
        Ok(())
    }

    #[test]
    fn test_reload_picks_up_file_changes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("restic.toml");
        let shared = SharedSettings::open(&path, &defaults(temp_dir.path()))?;

        let mut edited = shared.snapshot();
        edited.password = "rotated".to_string();
        std::fs::write(&path, toml::to_string_pretty(&edited)?)?;

        shared.reload()?;
        assert_eq!(shared.read(|s| s.password.clone()), "rotated");
        Ok(())
    }

    #[test]
    fn test_fixed_settings_reload_is_noop() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let shared = SharedSettings::fixed(defaults(temp_dir.path()));
        let before = shared.snapshot();
        shared.reload()?;
        assert_eq!(shared.snapshot(), before);
        Ok(())
    }
}

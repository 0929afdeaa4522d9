//! Builds restic invocations: fixed executable, repository environment,
//! non-interactive process flags.

use crate::config::SharedSettings;
use crate::utils::{AgentError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Host variables passed through so the executable can start at all
const PASSTHROUGH_ENV: &[&str] = &["PATH", "SystemRoot", "TEMP", "TMP", "HOME"];

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Which `restic stats` accounting to request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsMode {
    RawData,
    RestoreSize,
}

impl StatsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatsMode::RawData => "raw-data",
            StatsMode::RestoreSize => "restore-size",
        }
    }
}

/// A restic subcommand and its operands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Backup { path: PathBuf },
    Restore { snapshot: String, path: PathBuf },
    Forget { snapshots: Vec<String> },
    Stats { snapshot: String, mode: StatsMode },
    Snapshots { snapshot: String },
    CatConfig,
    Init,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Backup { .. } => "backup",
            Operation::Restore { .. } => "restore",
            Operation::Forget { .. } => "forget",
            Operation::Stats { .. } => "stats",
            Operation::Snapshots { .. } => "snapshots",
            Operation::CatConfig => "cat",
            Operation::Init => "init",
        }
    }

    /// Argument list passed after the executable
    pub fn args(&self) -> Result<Vec<OsString>> {
        let mut args: Vec<OsString> = vec![self.name().into()];

        match self {
            Operation::Backup { path } => {
                args.push(path.into());
                args.push("--json".into());
                // VSS snapshots only exist on Windows builds of restic
                if cfg!(windows) {
                    args.push("--use-fs-snapshot".into());
                    args.push("-o".into());
                    args.push("vss.timeout=30s".into());
                }
            }
            Operation::Restore { snapshot, path } => {
                if snapshot.is_empty() {
                    return Err(AgentError::InvalidArgument("snapshot id is empty".into()));
                }
                args.push("--json".into());
                args.push(format!("{}:{}", snapshot, to_restic_path(path)).into());
                args.push("--target".into());
                args.push(path.into());
            }
            Operation::Forget { snapshots } => {
                if snapshots.is_empty() {
                    return Err(AgentError::InvalidArgument(
                        "at least one snapshot is required".into(),
                    ));
                }
                args.push("--json".into());
                args.push("--prune".into());
                args.extend(snapshots.iter().map(OsString::from));
            }
            Operation::Stats { snapshot, mode } => {
                if snapshot.is_empty() {
                    return Err(AgentError::InvalidArgument("snapshot id is empty".into()));
                }
                args.push("--json".into());
                args.push("--mode".into());
                args.push(mode.as_str().into());
                args.push(snapshot.into());
            }
            Operation::Snapshots { snapshot } => {
                args.push("--json".into());
                if !snapshot.is_empty() {
                    args.push(snapshot.into());
                }
            }
            Operation::CatConfig => args.push("config".into()),
            Operation::Init => {}
        }

        Ok(args)
    }
}

/// Build a ready-to-spawn command for `op` from the current settings.
///
/// Settings are copied under the shared lock and the lock is released before returning.
pub fn build(settings: &SharedSettings, op: &Operation) -> Result<Command> {
    let args = op.args()?;
    let (binary, env) = settings.read(|s| {
        (
            s.binary(),
            [
                ("RESTIC_REPOSITORY", s.repository.clone().into_os_string()),
                ("RESTIC_PASSWORD", OsString::from(&s.password)),
                ("RESTIC_CACHE_DIR", s.cache_dir.clone().into_os_string()),
            ],
        )
    });

    let mut cmd = Command::new(&binary);
    cmd.args(&args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for key in PASSTHROUGH_ENV {
        if let Some(value) = std::env::var_os(key) {
            cmd.env(key, value);
        }
    }

    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    tracing::debug!(binary = %binary.display(), op = op.name(), "Built restic command");
    Ok(cmd)
}

/// Convert a host path to the form restic stores in snapshots.
///
/// `C:\saves\world` becomes `/C/saves/world`; Unix paths pass through unchanged.
pub fn to_restic_path(path: &Path) -> String {
    let unix = path.to_string_lossy().replace('\\', "/");
    let bytes = unix.as_bytes();

    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = bytes[0] as char;
        if bytes.len() == 2 {
            return format!("/{drive}");
        }
        if bytes[2] == b'/' {
            return format!("/{drive}{}", &unix[2..]);
        }
    }

    unix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResticSettings;

    fn strings(op: &Operation) -> Vec<String> {
        op.args()
            .unwrap()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_backup_args() {
        let args = strings(&Operation::Backup {
            path: PathBuf::from("/saves/world"),
        });
        assert_eq!(&args[..3], &["backup", "/saves/world", "--json"]);
        if cfg!(windows) {
            assert!(args.contains(&"--use-fs-snapshot".to_string()));
        } else {
            assert_eq!(args.len(), 3);
        }
    }

    #[test]
    fn test_restore_args() {
        let args = strings(&Operation::Restore {
            snapshot: "abc123".into(),
            path: PathBuf::from("/saves/world"),
        });
        assert_eq!(
            args,
            vec!["restore", "--json", "abc123:/saves/world", "--target", "/saves/world"]
        );
    }

    #[test]
    fn test_forget_args() {
        let args = strings(&Operation::Forget {
            snapshots: vec!["a1".into(), "b2".into()],
        });
        assert_eq!(args, vec!["forget", "--json", "--prune", "a1", "b2"]);
    }

    #[test]
    fn test_forget_requires_snapshot() {
        let err = Operation::Forget { snapshots: vec![] }.args().unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)));
    }

    #[test]
    fn test_stats_args() {
        let args = strings(&Operation::Stats {
            snapshot: "abc".into(),
            mode: StatsMode::RestoreSize,
        });
        assert_eq!(args, vec!["stats", "--json", "--mode", "restore-size", "abc"]);
    }

    #[test]
    fn test_cat_config_and_init_args() {
        assert_eq!(strings(&Operation::CatConfig), vec!["cat", "config"]);
        assert_eq!(strings(&Operation::Init), vec!["init"]);
    }

    #[test]
    fn test_to_restic_path() {
        assert_eq!(to_restic_path(Path::new("C:\\saves\\world")), "/C/saves/world");
        assert_eq!(to_restic_path(Path::new("D:")), "/D");
        assert_eq!(to_restic_path(Path::new("/home/me/world")), "/home/me/world");
        assert_eq!(to_restic_path(Path::new("relative\\dir")), "relative/dir");
    }

    #[test]
    fn test_build_sets_environment() {
        let settings = SharedSettings::fixed(ResticSettings {
            bin_dir: PathBuf::from("/opt/restic"),
            repository: PathBuf::from("/data/repo"),
            cache_dir: PathBuf::from("/data/cache"),
            password: "secret".into(),
        });
        let cmd = build(&settings, &Operation::Init).unwrap();
        let std_cmd = cmd.as_std();

        assert_eq!(
            std_cmd.get_program(),
            PathBuf::from("/opt/restic").join(crate::config::RESTIC_BINARY).as_os_str()
        );
        let envs: Vec<(String, String)> = std_cmd
            .get_envs()
            .filter_map(|(k, v)| {
                Some((k.to_string_lossy().into_owned(), v?.to_string_lossy().into_owned()))
            })
            .collect();
        assert!(envs.contains(&("RESTIC_REPOSITORY".into(), "/data/repo".into())));
        assert!(envs.contains(&("RESTIC_PASSWORD".into(), "secret".into())));
        assert!(envs.contains(&("RESTIC_CACHE_DIR".into(), "/data/cache".into())));
    }
}

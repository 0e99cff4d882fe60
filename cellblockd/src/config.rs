//! Daemon configuration.
//!
//! Values come from, in order of precedence: command-line flags, the
//! `CELLBLOCK_*` environment, the `[daemon]` table of a TOML file, and the
//! built-in defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::termbuf::DEFAULT_TTY_BUFFER_SIZE;

pub const DEFAULT_SOCKET: &str = "/var/run/cellblock.sock";
pub const DEFAULT_DATA_DIR: &str = "/usr/local/cellblock";
pub const CONFIG_FILE_NAME: &str = "cellblockd.toml";

/// Data sub-directories the daemon creates on startup.
const DATA_SUBDIRS: &[&str] = &["spool", "lib", "locks", "networks", "unions"];
/// Created by the filesystem scripts on ZFS, where they are datasets.
const DATASET_SUBDIRS: &[&str] = &["instances", "images"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum UnderlyingFs {
    Zfs,
    Ufs,
    FuseUnionfs,
}

impl UnderlyingFs {
    pub fn as_str(self) -> &'static str {
        match self {
            UnderlyingFs::Zfs => "zfs",
            UnderlyingFs::Ufs => "ufs",
            UnderlyingFs::FuseUnionfs => "fuse-unionfs",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    daemon: DaemonSection,
}

/// The `[daemon]` table. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DaemonSection {
    pub socket: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub underlying_fs: Option<UnderlyingFs>,
    pub tty_buffer_size: Option<usize>,
    pub sock_owner: Option<String>,
    pub log_file: Option<PathBuf>,
    pub verbose: Option<u8>,
}

impl DaemonSection {
    /// Fill unset keys from `lower`.
    fn or(self, lower: DaemonSection) -> DaemonSection {
        DaemonSection {
            socket: self.socket.or(lower.socket),
            data_dir: self.data_dir.or(lower.data_dir),
            underlying_fs: self.underlying_fs.or(lower.underlying_fs),
            tty_buffer_size: self.tty_buffer_size.or(lower.tty_buffer_size),
            sock_owner: self.sock_owner.or(lower.sock_owner),
            log_file: self.log_file.or(lower.log_file),
            verbose: self.verbose.or(lower.verbose),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub socket: PathBuf,
    pub data_dir: PathBuf,
    pub underlying_fs: UnderlyingFs,
    pub tty_buffer_size: usize,
    pub sock_owner: Option<String>,
    pub log_file: Option<PathBuf>,
    pub verbose: u8,
}

impl Config {
    /// Merge the layers. `cli` is highest precedence, `file` lowest.
    pub fn resolve(
        cli: DaemonSection,
        env: impl Fn(&str) -> Option<String>,
        file: DaemonSection,
    ) -> Result<Config> {
        let from_env = DaemonSection {
            socket: env("CELLBLOCK_SOCKET").map(PathBuf::from),
            data_dir: env("CELLBLOCK_DATA_DIR").map(PathBuf::from),
            ..DaemonSection::default()
        };
        let merged = cli.or(from_env).or(file);

        let Some(underlying_fs) = merged.underlying_fs else {
            bail!("an underlying filesystem must be selected (--underlying-fs zfs|ufs|fuse-unionfs)");
        };
        let tty_buffer_size = merged.tty_buffer_size.unwrap_or(DEFAULT_TTY_BUFFER_SIZE);
        if tty_buffer_size == 0 {
            bail!("tty buffer size must be greater than zero");
        }

        Ok(Config {
            socket: merged.socket.unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET)),
            data_dir: merged
                .data_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            underlying_fs,
            tty_buffer_size,
            sock_owner: merged.sock_owner.filter(|owner| !owner.is_empty()),
            log_file: merged.log_file,
            verbose: merged.verbose.unwrap_or(0),
        })
    }

    /// Configuration rooted at `data_dir` with everything else defaulted.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>, underlying_fs: UnderlyingFs) -> Config {
        let data_dir = data_dir.into();
        Config {
            socket: data_dir.join("cellblock.sock"),
            data_dir,
            underlying_fs,
            tty_buffer_size: DEFAULT_TTY_BUFFER_SIZE,
            sock_owner: None,
            log_file: None,
            verbose: 0,
        }
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }

    /// Create the data directory layout if missing.
    pub fn prepare_data_dir(&self) -> Result<()> {
        let mut subdirs: Vec<&str> = DATA_SUBDIRS.to_vec();
        if self.underlying_fs != UnderlyingFs::Zfs {
            subdirs.extend_from_slice(DATASET_SUBDIRS);
        }
        for sub in subdirs {
            let path = self.data_dir.join(sub);
            fs::create_dir_all(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
        }
        Ok(())
    }
}

/// `--config`, then `CELLBLOCK_CONFIG`, then `./cellblockd.toml` if present.
pub fn config_path(cli: Option<PathBuf>) -> Option<PathBuf> {
    cli.or_else(|| std::env::var("CELLBLOCK_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let candidate = std::env::current_dir().ok()?.join(CONFIG_FILE_NAME);
            candidate.is_file().then_some(candidate)
        })
}

/// Read the `[daemon]` table from `path`.
pub fn load_file(path: &Path) -> Result<DaemonSection> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let parsed: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(parsed.daemon)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn cli_beats_env_beats_file() {
        let file = DaemonSection {
            socket: Some("/file.sock".into()),
            data_dir: Some("/file-data".into()),
            underlying_fs: Some(UnderlyingFs::Zfs),
            tty_buffer_size: Some(4096),
            ..Default::default()
        };
        let env = |key: &str| match key {
            "CELLBLOCK_SOCKET" => Some("/env.sock".to_string()),
            "CELLBLOCK_DATA_DIR" => Some("/env-data".to_string()),
            _ => None,
        };
        let cli = DaemonSection {
            data_dir: Some("/cli-data".into()),
            ..Default::default()
        };

        let config = Config::resolve(cli, env, file).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/cli-data"));
        assert_eq!(config.socket, PathBuf::from("/env.sock"));
        assert_eq!(config.underlying_fs, UnderlyingFs::Zfs);
        assert_eq!(config.tty_buffer_size, 4096);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cli = DaemonSection {
            underlying_fs: Some(UnderlyingFs::Ufs),
            ..Default::default()
        };
        let config = Config::resolve(cli, no_env, DaemonSection::default()).unwrap();
        assert_eq!(config.socket, PathBuf::from(DEFAULT_SOCKET));
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.tty_buffer_size, DEFAULT_TTY_BUFFER_SIZE);
        assert_eq!(config.verbose, 0);
        assert!(config.sock_owner.is_none());
    }

    #[test]
    fn underlying_fs_is_required() {
        let err = Config::resolve(DaemonSection::default(), no_env, DaemonSection::default())
            .unwrap_err();
        assert!(err.to_string().contains("underlying filesystem"));
    }

    #[test]
    fn toml_daemon_table_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "[daemon]\nunderlying_fs = \"fuse-unionfs\"\ntty_buffer_size = 8192\nsock_owner = \"operator\"\n",
        )
        .unwrap();
        let section = load_file(&path).unwrap();
        assert_eq!(section.underlying_fs, Some(UnderlyingFs::FuseUnionfs));
        assert_eq!(section.tty_buffer_size, Some(8192));
        assert_eq!(section.sock_owner.as_deref(), Some("operator"));

        fs::write(&path, "[daemon\n").unwrap();
        assert!(load_file(&path).is_err());
    }

    #[test]
    fn data_dir_layout_depends_on_fs() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(dir.path(), UnderlyingFs::Zfs);
        config.prepare_data_dir().unwrap();
        assert!(dir.path().join("locks").is_dir());
        assert!(!dir.path().join("instances").exists());

        let config = Config::for_data_dir(dir.path(), UnderlyingFs::Ufs);
        config.prepare_data_dir().unwrap();
        assert!(config.instances_dir().is_dir());
        assert!(dir.path().join("images").is_dir());
    }
}

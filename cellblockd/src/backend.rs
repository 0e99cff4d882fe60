//! External provisioning scripts.
//!
//! Jail creation, filesystem cloning, networking and image commit are done
//! by shell scripts under `<data>/lib`. The daemon only sequences them and
//! looks at their exit status.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use tracing::debug;

use cellblock_common::protocol::{InstanceKind, LaunchRequest};

use crate::config::UnderlyingFs;

const SCRIPT_PATH: &str = "/sbin:/bin:/usr/sbin:/usr/bin:/usr/local/sbin:/usr/local/bin";

/// Generic commands a client may run, mapped to their script.
pub const GENERIC_COMMANDS: &[(&str, &str)] = &[
    ("instance_prune", "cmd_prune.sh"),
    ("network-create", "network_create.sh"),
    ("image_list", "cmd_image.sh"),
];

pub fn generic_script(name: &str) -> Option<&'static str> {
    GENERIC_COMMANDS
        .iter()
        .find(|(command, _)| *command == name)
        .map(|(_, script)| *script)
}

/// Exit code of a finished child; death by signal maps to `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Arguments for bootstrapping one build stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBootstrap {
    pub build_root: PathBuf,
    pub index: usize,
    pub base: String,
    pub context_archive: PathBuf,
    /// Earlier stages this stage copies from.
    pub deps: Vec<usize>,
    pub instance: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCommit {
    pub build_root: PathBuf,
    pub last_stage: usize,
    pub image: String,
    pub n_stages: usize,
    pub instance: String,
    pub tag: String,
    pub fim_spec: bool,
}

pub trait ProvisioningBackend: Send + Sync {
    /// Command that launches a regular instance; run on the instance's pty.
    fn launch_command(&self, id: &str, request: &LaunchRequest) -> Command;

    fn bootstrap_stage(&self, stage: &StageBootstrap) -> io::Result<i32>;

    fn execute_stage(&self, stage_root: &Path, instance: &str, os_release: &str)
        -> io::Result<i32>;

    fn commit_image(&self, commit: &ImageCommit) -> io::Result<i32>;

    /// Release jail, filesystem and network resources of a finished instance.
    fn teardown(&self, id: &str, kind: InstanceKind) -> io::Result<i32>;

    /// Command for a whitelisted generic command. The caller owns stdio.
    fn generic_command(&self, script: &str, args: &[String], verbose: bool) -> Command;

    /// One-time host preparation (`--create-forge`).
    fn create_forge(&self, path: &Path) -> io::Result<i32>;
}

#[derive(Debug, Clone)]
pub struct ScriptBackend {
    data_dir: PathBuf,
    underlying_fs: UnderlyingFs,
    verbose: bool,
}

impl ScriptBackend {
    pub fn new(data_dir: impl Into<PathBuf>, underlying_fs: UnderlyingFs, verbose: bool) -> Self {
        Self {
            data_dir: data_dir.into(),
            underlying_fs,
            verbose,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn script(&self, name: &str, trace: bool) -> Command {
        let mut cmd = Command::new("/bin/sh");
        if trace {
            cmd.arg("-x");
        }
        cmd.arg(self.data_dir.join("lib").join(name));
        cmd.env_clear()
            .env("PATH", SCRIPT_PATH)
            .env("CELLBLOCK_FS", self.underlying_fs.as_str());
        cmd
    }

    fn run(&self, mut cmd: Command) -> io::Result<i32> {
        debug!(command = ?cmd, "running provisioning script");
        Ok(exit_code(cmd.status()?))
    }
}

impl ProvisioningBackend for ScriptBackend {
    fn launch_command(&self, id: &str, request: &LaunchRequest) -> Command {
        let mut cmd = self.script("stage_launch.sh", request.verbose);
        cmd.env("TERM", &request.term)
            .env("USER", "root")
            .env("HOME", "/root")
            .arg(&self.data_dir)
            .arg(&request.image)
            .arg(id)
            .arg(request.volumes.as_deref().unwrap_or(""))
            .arg(
                request
                    .network
                    .as_deref()
                    .filter(|n| !n.is_empty())
                    .unwrap_or("default"),
            )
            .arg(&request.tag)
            .arg(
                request
                    .ports
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .unwrap_or("none"),
            )
            .args(&request.entry_args);
        cmd
    }

    fn bootstrap_stage(&self, stage: &StageBootstrap) -> io::Result<i32> {
        let deps = stage
            .deps
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let mut cmd = self.script("stage_bootstrap_build.sh", self.verbose);
        cmd.arg(&stage.build_root)
            .arg(stage.index.to_string())
            .arg(&stage.base)
            .arg(&self.data_dir)
            .arg(&stage.context_archive)
            .arg(deps)
            .arg(&stage.instance);
        if let Some(name) = &stage.name {
            cmd.arg(name);
        }
        self.run(cmd)
    }

    fn execute_stage(
        &self,
        stage_root: &Path,
        instance: &str,
        os_release: &str,
    ) -> io::Result<i32> {
        let mut cmd = self.script("stage_build.sh", self.verbose);
        cmd.env("USER", "root")
            .env("HOME", "/root")
            .env("TERM", "xterm")
            .env("BLOCKSIZE", "K")
            .env("SHELL", "/bin/sh")
            .arg(stage_root)
            .arg(instance)
            .arg(os_release);
        self.run(cmd)
    }

    fn commit_image(&self, commit: &ImageCommit) -> io::Result<i32> {
        let mut cmd = self.script("stage_commit.sh", self.verbose);
        cmd.arg(&commit.build_root)
            .arg(commit.last_stage.to_string())
            .arg(&self.data_dir)
            .arg(&commit.image)
            .arg(commit.n_stages.to_string())
            .arg(&commit.instance)
            .arg(if commit.fim_spec { "ON" } else { "OFF" })
            .arg(&commit.tag);
        self.run(cmd)
    }

    fn teardown(&self, id: &str, kind: InstanceKind) -> io::Result<i32> {
        let mut cmd = self.script("stage_launch_cleanup.sh", self.verbose);
        cmd.arg(&self.data_dir).arg(id).arg(kind.as_str());
        self.run(cmd)
    }

    fn generic_command(&self, script: &str, args: &[String], verbose: bool) -> Command {
        let mut cmd = self.script(script, verbose || self.verbose);
        cmd.arg("-R").arg(&self.data_dir).args(args);
        cmd
    }

    fn create_forge(&self, path: &Path) -> io::Result<i32> {
        let mut cmd = self.script("create_forge.sh", self.verbose);
        cmd.arg(&self.data_dir).arg(path);
        self.run(cmd)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    /// Records every pipeline call and answers with scripted exit codes.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub calls: Mutex<Vec<String>>,
        pub bootstrap_status: Vec<(usize, i32)>,
        pub execute_status: i32,
        pub commit_status: i32,
    }

    impl FakeBackend {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl ProvisioningBackend for FakeBackend {
        fn launch_command(&self, id: &str, _request: &LaunchRequest) -> Command {
            self.record(format!("launch {}", id));
            Command::new("true")
        }

        fn bootstrap_stage(&self, stage: &StageBootstrap) -> io::Result<i32> {
            self.record(format!("bootstrap {} deps={:?}", stage.index, stage.deps));
            Ok(self
                .bootstrap_status
                .iter()
                .find(|(index, _)| *index == stage.index)
                .map_or(0, |(_, code)| *code))
        }

        fn execute_stage(&self, stage_root: &Path, _instance: &str, _os: &str) -> io::Result<i32> {
            let stage = stage_root
                .parent()
                .and_then(Path::file_name)
                .and_then(OsStr::to_str)
                .unwrap_or("?")
                .to_string();
            self.record(format!("execute {}", stage));
            Ok(self.execute_status)
        }

        fn commit_image(&self, commit: &ImageCommit) -> io::Result<i32> {
            self.record(format!("commit {} last={}", commit.image, commit.last_stage));
            Ok(self.commit_status)
        }

        fn teardown(&self, id: &str, kind: InstanceKind) -> io::Result<i32> {
            self.record(format!("teardown {} {}", id, kind.as_str()));
            Ok(0)
        }

        fn generic_command(&self, script: &str, _args: &[String], _verbose: bool) -> Command {
            self.record(format!("generic {}", script));
            Command::new("true")
        }

        fn create_forge(&self, _path: &Path) -> io::Result<i32> {
            self.record("forge".to_string());
            Ok(0)
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        let lib = dir.join("lib");
        fs::create_dir_all(&lib).unwrap();
        let path = lib.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn generic_table_lookup() {
        assert_eq!(generic_script("image_list"), Some("cmd_image.sh"));
        assert_eq!(generic_script("network-create"), Some("network_create.sh"));
        assert_eq!(generic_script("rm -rf"), None);
    }

    #[test]
    fn scripts_receive_arguments_and_fs_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args.txt");
        write_script(
            dir.path(),
            "stage_commit.sh",
            &format!(
                "echo \"$CELLBLOCK_FS $*\" > '{}'\nexit 7\n",
                out.display()
            ),
        );
        let backend = ScriptBackend::new(dir.path(), UnderlyingFs::Ufs, false);
        let mut commit = ImageCommit {
            build_root: PathBuf::from("/data/instances/abc"),
            last_stage: 1,
            image: "web".into(),
            n_stages: 2,
            instance: "abc".into(),
            tag: "latest".into(),
            fim_spec: false,
        };
        assert_eq!(backend.commit_image(&commit).unwrap(), 7);
        let recorded = fs::read_to_string(&out).unwrap();
        assert_eq!(
            recorded.trim(),
            format!(
                "ufs /data/instances/abc 1 {} web 2 abc OFF latest",
                dir.path().display()
            )
        );

        commit.fim_spec = true;
        backend.commit_image(&commit).unwrap();
        let recorded = fs::read_to_string(&out).unwrap();
        assert!(recorded.trim().ends_with("abc ON latest"), "{recorded}");
    }

    #[test]
    fn launch_command_fills_defaults() {
        let backend = ScriptBackend::new("/var/cellblock", UnderlyingFs::Zfs, false);
        let request = LaunchRequest {
            image: "alpine".into(),
            tag: "latest".into(),
            term: "xterm".into(),
            entry_args: vec!["/bin/sh".into()],
            ..Default::default()
        };
        let cmd = backend.launch_command("abc", &request);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "/var/cellblock/lib/stage_launch.sh",
                "/var/cellblock",
                "alpine",
                "abc",
                "",
                "default",
                "latest",
                "none",
                "/bin/sh",
            ]
        );
        let term = cmd
            .get_envs()
            .find(|(key, _)| *key == "TERM")
            .and_then(|(_, value)| value);
        assert_eq!(term, Some(OsStr::new("xterm")));
    }

    #[test]
    fn signal_deaths_map_above_128() {
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg("kill -TERM $$")
            .status()
            .unwrap();
        assert_eq!(exit_code(status), 128 + libc::SIGTERM);
    }
}

//! Multi-stage image builds.
//!
//! The daemon side receives a SEND_BUILD_CTX upload, spools the context
//! archive and starts a build instance on a fresh pty. That instance is the
//! daemon binary re-executed as `cellblockd run-build`, which loads the
//! serialised [`BuildContext`] and runs [`pipeline::run_pipeline`].

pub mod copy_from;
pub mod pipeline;
pub mod script;

use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cellblock_common::manifest::{self, BuildStage, BuildStep};
use cellblock_common::protocol::{
    read_frame, BuildContextHeader, Frame, InstanceKind, Response, StageList, StepList, Tag,
    MAX_BUILD_STAGES, MAX_BUILD_STEPS,
};

use crate::backend::ScriptBackend;
use crate::config::{Config, UnderlyingFs};
use crate::daemon::Daemon;
use crate::dispatch::{send_response, Flow};
use crate::error::InstanceError;
use crate::instance::{generate_id, short_id};

/// Everything the build worker needs, written next to the spool as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContext {
    pub instance: String,
    pub image: String,
    pub tag: String,
    pub verbose: bool,
    pub entry_point: Option<String>,
    pub entry_args: Option<String>,
    pub os_release: Option<String>,
    pub term: String,
    #[serde(default)]
    pub fim_spec: bool,
    pub data_dir: PathBuf,
    pub underlying_fs: UnderlyingFs,
    pub stages: Vec<BuildStage>,
    pub steps: Vec<BuildStep>,
}

impl BuildContext {
    pub fn new(
        instance: String,
        header: BuildContextHeader,
        stages: Vec<BuildStage>,
        steps: Vec<BuildStep>,
        config: &Config,
    ) -> Self {
        Self {
            instance,
            image: header.image,
            tag: header.tag,
            verbose: header.verbose,
            entry_point: header.entry_point,
            entry_args: header.entry_args,
            os_release: header.os_release,
            term: header.term,
            fim_spec: header.fim_spec,
            data_dir: config.data_dir.clone(),
            underlying_fs: config.underlying_fs,
            stages,
            steps,
        }
    }

    fn instances_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }

    pub fn build_root(&self) -> PathBuf {
        self.instances_dir().join(&self.instance)
    }

    /// Spooled context archive uploaded by the client.
    pub fn context_archive(&self) -> PathBuf {
        self.instances_dir().join(format!("{}.tar.gz", self.instance))
    }

    pub fn context_file(&self) -> PathBuf {
        self.instances_dir().join(format!("{}.json", self.instance))
    }

    pub fn stage_dir(&self, stage: usize) -> PathBuf {
        self.build_root().join(stage.to_string())
    }

    pub fn stage_root(&self, stage: usize) -> PathBuf {
        self.stage_dir(stage).join("root")
    }

    pub fn script_path(&self, stage: usize) -> PathBuf {
        self.instances_dir()
            .join(format!("{}.{}.sh", self.instance, stage))
    }

    pub fn copy_from_archive(&self, stage: usize) -> PathBuf {
        self.instances_dir()
            .join(format!("copy_from_{}_{}.tar", self.instance, stage))
    }

    /// Remove what the receive path created. Used when a build never starts.
    fn discard(&self) {
        let _ = fs::remove_file(self.context_archive());
        let _ = fs::remove_file(self.context_file());
        let _ = fs::remove_dir_all(self.build_root());
    }
}

fn next_part<T: serde::de::DeserializeOwned>(stream: &mut UnixStream, what: &str) -> Result<T> {
    let Some(frame) = read_frame(stream)? else {
        bail!("client closed the connection before sending the {}", what);
    };
    Ok(frame.decode(Tag::SendBuildCtx)?)
}

/// Receive a build upload and start its build instance.
pub fn handle_build(daemon: &Daemon, stream: &mut UnixStream, frame: Frame) -> Result<Flow> {
    let header: BuildContextHeader = frame.decode(Tag::SendBuildCtx)?;
    if header.n_stages > MAX_BUILD_STAGES || header.n_steps > MAX_BUILD_STEPS {
        warn!(
            stages = header.n_stages,
            steps = header.n_steps,
            "rejecting oversized build"
        );
        send_response(stream, &InstanceError::BuildTooLarge.to_response())?;
        return Ok(Flow::Close);
    }

    let stages: StageList = next_part(stream, "stage list")?;
    let steps: StepList = next_part(stream, "step list")?;
    if stages.len() != header.n_stages || steps.len() != header.n_steps {
        bail!(
            "build header declared {} stages and {} steps, received {} and {}",
            header.n_stages,
            header.n_steps,
            stages.len(),
            steps.len()
        );
    }
    if let Err(err) = manifest::validate(&stages, &steps) {
        debug!(error = %err, "rejecting invalid build manifest");
        send_response(stream, &InstanceError::from(err).to_response())?;
        return Ok(Flow::Close);
    }

    let context_size = header.context_size;
    let ctx = BuildContext::new(generate_id(), header, stages, steps, &daemon.config);

    let mut spool = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(ctx.context_archive())
    {
        Ok(file) => file,
        Err(err) => {
            warn!(instance = short_id(&ctx.instance), error = %err, "failed to create build spool");
            let message = format!("could not write to build spool: {}", err);
            send_response(stream, &Response::error(libc::EIO, message))?;
            return Ok(Flow::Close);
        }
    };
    if let Err(err) = fs::create_dir(ctx.build_root()) {
        ctx.discard();
        let message = format!("failed to initialize build env: {}", err);
        send_response(stream, &Response::error(libc::EIO, message))?;
        return Ok(Flow::Close);
    }

    let received = io::copy(&mut (&*stream).take(context_size), &mut spool);
    match received {
        Ok(n) if n == context_size => {}
        Ok(n) => {
            ctx.discard();
            bail!("build context truncated: received {} of {} bytes", n, context_size);
        }
        Err(err) => {
            ctx.discard();
            return Err(err).context("failed to spool build context");
        }
    }
    drop(spool);

    match start_build(daemon, &ctx) {
        Ok(id) => {
            info!(
                instance = short_id(&id),
                image = %ctx.image,
                stages = ctx.stages.len(),
                steps = ctx.steps.len(),
                "build started"
            );
            send_response(stream, &Response::ok(id))?;
        }
        Err(err) => {
            warn!(instance = short_id(&ctx.instance), error = ?err, "failed to start build");
            ctx.discard();
            send_response(stream, &Response::error(libc::EIO, format!("{:#}", err)))?;
        }
    }
    Ok(Flow::Close)
}

fn start_build(daemon: &Daemon, ctx: &BuildContext) -> Result<String> {
    let context_file = ctx.context_file();
    let encoded = serde_json::to_vec_pretty(ctx)?;
    fs::write(&context_file, encoded)
        .with_context(|| format!("failed to write {}", context_file.display()))?;

    let exe = std::env::current_exe().context("failed to locate the daemon executable")?;
    let mut command = Command::new(exe);
    command.arg("run-build").arg("--context").arg(&context_file);
    if !ctx.term.is_empty() {
        command.env("TERM", &ctx.term);
    }
    daemon.spawn_instance(
        ctx.instance.clone(),
        ctx.image.clone(),
        InstanceKind::Build,
        command,
    )
}

/// Entry point of `cellblockd run-build`. Returns the build status.
pub fn run_build_child(context_file: &Path) -> Result<i32> {
    let raw = fs::read(context_file)
        .with_context(|| format!("failed to read {}", context_file.display()))?;
    let mut ctx: BuildContext = serde_json::from_slice(&raw)
        .with_context(|| format!("malformed build context {}", context_file.display()))?;
    let backend = ScriptBackend::new(&ctx.data_dir, ctx.underlying_fs, ctx.verbose);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    Ok(pipeline::run_pipeline(&mut ctx, &backend, &mut out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::FakeBackend;
    use cellblock_common::manifest::StepOp;
    use cellblock_common::protocol::write_frame;
    use std::io::Write;
    use std::sync::Arc;

    fn daemon() -> (tempfile::TempDir, Daemon) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(dir.path(), UnderlyingFs::Ufs);
        config.prepare_data_dir().unwrap();
        fs::create_dir_all(config.instances_dir()).unwrap();
        let daemon = Daemon::new(config, Arc::new(FakeBackend::default()));
        (dir, daemon)
    }

    fn header(n_stages: usize, n_steps: usize, context_size: u64) -> Frame {
        Frame::json(
            Tag::SendBuildCtx,
            &BuildContextHeader {
                image: "web".into(),
                n_stages,
                n_steps,
                context_size,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn stage(index: usize) -> BuildStage {
        BuildStage {
            index,
            base: "freebsd".into(),
            name: None,
            is_last: false,
        }
    }

    fn response(stream: &mut UnixStream) -> Response {
        read_frame(stream)
            .unwrap()
            .unwrap()
            .decode(Tag::Response)
            .unwrap()
    }

    #[test]
    fn paths_hang_off_the_instances_dir() {
        let config = Config::for_data_dir("/data", UnderlyingFs::Zfs);
        let ctx = BuildContext::new(
            "abc".into(),
            BuildContextHeader::default(),
            vec![stage(0)],
            Vec::new(),
            &config,
        );
        assert_eq!(ctx.build_root(), Path::new("/data/instances/abc"));
        assert_eq!(ctx.context_archive(), Path::new("/data/instances/abc.tar.gz"));
        assert_eq!(ctx.stage_root(2), Path::new("/data/instances/abc/2/root"));
        assert_eq!(ctx.script_path(1), Path::new("/data/instances/abc.1.sh"));
        assert_eq!(
            ctx.copy_from_archive(0),
            Path::new("/data/instances/copy_from_abc_0.tar")
        );
    }

    #[test]
    fn oversized_build_is_rejected_before_reading_further() {
        let (_dir, daemon) = daemon();
        let (mut server, mut client) = UnixStream::pair().unwrap();
        let flow = handle_build(&daemon, &mut server, header(MAX_BUILD_STAGES + 1, 1, 0)).unwrap();
        assert!(matches!(flow, Flow::Close));
        let resp = response(&mut client);
        assert_eq!(resp.code, libc::E2BIG);
        assert_eq!(resp.message, "too many build stages/steps");
        assert_eq!(daemon.registry.count(), 0);
    }

    #[test]
    fn forward_copy_from_is_rejected() {
        let (dir, daemon) = daemon();
        let (mut server, mut client) = UnixStream::pair().unwrap();
        let stages = vec![stage(0), stage(1)];
        let steps = vec![BuildStep::new(
            0,
            StepOp::CopyFrom {
                stage: 1,
                source: "/bin/app".into(),
                dest: "/bin/".into(),
            },
        )];
        write_frame(&mut client, &Frame::json(Tag::SendBuildCtx, &stages).unwrap()).unwrap();
        write_frame(&mut client, &Frame::json(Tag::SendBuildCtx, &steps).unwrap()).unwrap();

        handle_build(&daemon, &mut server, header(2, 1, 0)).unwrap();
        let resp = response(&mut client);
        assert_eq!(resp.code, libc::EINVAL);
        assert!(resp.message.contains("copies from stage 1"));
        assert_eq!(fs::read_dir(dir.path().join("instances")).unwrap().count(), 0);
    }

    #[test]
    fn count_mismatch_is_a_protocol_error() {
        let (_dir, daemon) = daemon();
        let (mut server, mut client) = UnixStream::pair().unwrap();
        write_frame(&mut client, &Frame::json(Tag::SendBuildCtx, &vec![stage(0)]).unwrap()).unwrap();
        write_frame(&mut client, &Frame::json(Tag::SendBuildCtx, &StepList::new()).unwrap()).unwrap();
        assert!(handle_build(&daemon, &mut server, header(2, 0, 0)).is_err());
    }

    #[test]
    fn truncated_upload_leaves_nothing_behind() {
        let (dir, daemon) = daemon();
        let (mut server, mut client) = UnixStream::pair().unwrap();
        write_frame(&mut client, &Frame::json(Tag::SendBuildCtx, &vec![stage(0)]).unwrap()).unwrap();
        write_frame(&mut client, &Frame::json(Tag::SendBuildCtx, &StepList::new()).unwrap()).unwrap();
        client.write_all(b"abc").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let err = handle_build(&daemon, &mut server, header(1, 0, 10)).unwrap_err();
        assert!(err.to_string().contains("received 3 of 10 bytes"));
        assert_eq!(fs::read_dir(dir.path().join("instances")).unwrap().count(), 0);
        assert_eq!(daemon.registry.count(), 0);
    }
}

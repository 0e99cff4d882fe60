//! Shell script synthesis for one build stage.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use shell_escape::escape;

use cellblock_common::manifest::{AddKind, BuildStep, StepOp};

/// Sourced by every stage script; written into the jail by the bootstrap
/// script and defines `stage_tmp_dir`.
pub const BUILD_VARIABLES: &str = "/tmp/cellblock_build_variables.sh";
/// Symlink a ROOT-PIVOT step points at the new root directory.
pub const ROOT_PIVOT_LINK: &str = "/cellblock-root-ptr";

fn quote(raw: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(raw))
}

/// Render the script for the steps of one stage, in manifest order.
pub fn render(steps: &[&BuildStep], verbose: bool) -> String {
    let mut out = String::new();
    out.push_str("#!/bin/sh\n\n");
    let _ = writeln!(out, ". {}", BUILD_VARIABLES);
    out.push_str("set -e\n");
    if verbose {
        out.push_str("set -x\n");
    }

    let total = steps.len();
    for (n, step) in steps.iter().enumerate() {
        out.push_str("printf '\\033[1m--\\033[0m'\n");
        let banner = format!(" Step {}/{} : {}", n + 1, total, step.label());
        let _ = writeln!(out, "echo {}", quote(&banner));
        render_op(&mut out, &step.op);
    }
    out
}

fn render_op(out: &mut String, op: &StepOp) {
    let _ = match op {
        StepOp::Env { key, value } => {
            writeln!(out, "export {}=\"{}\"", key, value)
        }
        StepOp::RootPivot { dir } => {
            writeln!(out, "ln -s {} {}", quote(dir), ROOT_PIVOT_LINK)
        }
        StepOp::Run { command } => writeln!(out, "{}", command),
        StepOp::Workdir { dir } => writeln!(out, "cd {}", quote(dir)),
        StepOp::Copy { source, dest } => writeln!(
            out,
            "cp -pr \"${{stage_tmp_dir}}\"/{} {}",
            quote(source),
            quote(dest)
        ),
        StepOp::CopyFrom {
            stage,
            source,
            dest,
        } => writeln!(
            out,
            "cp -pr /tmp/stage{}/{} {}",
            stage,
            quote(source.trim_start_matches('/')),
            quote(dest)
        ),
        StepOp::Add { kind, source, dest } => render_add(out, *kind, source, dest),
    };
}

fn render_add(out: &mut String, kind: AddKind, source: &str, dest: &str) -> std::fmt::Result {
    match kind {
        AddKind::File => writeln!(
            out,
            "cp -pr \"${{stage_tmp_dir}}\"/{} {}",
            quote(source),
            quote(dest)
        ),
        AddKind::Archive => writeln!(
            out,
            "tar -C {} -zpxf \"${{stage_tmp_dir}}\"/{}",
            quote(dest),
            quote(source)
        ),
        AddKind::Url => writeln!(out, "fetch -q -o {} {}", quote(dest), quote(source)),
        AddKind::ArchiveUrl => {
            out.push_str("_archive=$(mktemp)\n");
            writeln!(out, "fetch -q -o \"$_archive\" {}", quote(source))?;
            writeln!(out, "tar -C {} -zpxf \"$_archive\"", quote(dest))?;
            writeln!(out, "rm -f \"$_archive\"")
        }
    }
}

pub fn write(path: &Path, steps: &[&BuildStep], verbose: bool) -> io::Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o755)
        .open(path)?;
    file.write_all(render(steps, verbose).as_bytes())?;
    file.sync_all()
}

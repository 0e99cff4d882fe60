//! The multi-stage build pipeline, run by the build instance's own process.
//!
//! Stages run strictly in index order. For each one the stage script is
//! written, COPY-FROM archives are cut from the earlier stages it depends on,
//! and the bootstrap and execution scripts run. The first non-zero exit ends
//! the build with that status.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use cellblock_common::manifest::{stage_dependencies, steps_for, BuildStep};

use super::{copy_from, script, BuildContext};
use crate::backend::{ImageCommit, ProvisioningBackend, StageBootstrap};

const MARK: &str = "\x1b[1m--\x1b[0m";

fn progress(out: &mut dyn Write, line: fmt::Arguments<'_>) {
    let _ = writeln!(out, "{} {}", MARK, line);
    let _ = out.flush();
}

/// Run every stage then commit the image. Returns the build status.
pub fn run_pipeline(
    ctx: &mut BuildContext,
    backend: &dyn ProvisioningBackend,
    out: &mut dyn Write,
) -> i32 {
    let outcome = match run_stages(ctx, backend, out) {
        Ok(0) => commit(ctx, backend, out),
        other => other,
    };
    let status = match outcome {
        Ok(status) => status,
        Err(err) => {
            progress(out, format_args!("Build failed: {:#}", err));
            1
        }
    };

    progress(out, format_args!("Cleaning up ephemeral images and build artifacts"));
    remove_artifacts(ctx);
    info!(instance = %ctx.instance, image = %ctx.image, status, "build finished");
    status
}

fn run_stages(
    ctx: &BuildContext,
    backend: &dyn ProvisioningBackend,
    out: &mut dyn Write,
) -> Result<i32> {
    let total = ctx.stages.len();
    progress(out, format_args!("Bootstrapping build stages 1 through {}", total));

    for (position, stage) in ctx.stages.iter().enumerate() {
        let index = stage.index;
        let stage_root = ctx.stage_root(index);
        fs::create_dir_all(&stage_root)
            .with_context(|| format!("failed to create {}", stage_root.display()))?;

        let steps: Vec<&BuildStep> = steps_for(index, &ctx.steps).collect();
        let script_path = ctx.script_path(index);
        script::write(&script_path, &steps, ctx.verbose)
            .with_context(|| format!("failed to write {}", script_path.display()))?;

        let copies = copy_from::sources_by_stage(index, &ctx.steps);
        if !copies.is_empty() {
            progress(out, format_args!("Stage has COPY FROM instruction"));
        }
        for (from, sources) in &copies {
            let archive = ctx.copy_from_archive(*from);
            copy_from::write_archive(&ctx.stage_root(*from), sources, &archive)
                .with_context(|| format!("failed to archive COPY FROM sources of stage {}", from))?;
        }

        let bootstrap = StageBootstrap {
            build_root: ctx.build_root(),
            index,
            base: stage.base.clone(),
            context_archive: ctx.context_archive(),
            deps: stage_dependencies(index, &ctx.steps),
            instance: ctx.instance.clone(),
            name: stage.name.clone(),
        };
        debug!(stage = index, deps = ?bootstrap.deps, "bootstrapping stage");
        let status = backend
            .bootstrap_stage(&bootstrap)
            .context("failed to run stage bootstrap script")?;
        if status != 0 {
            progress(
                out,
                format_args!("Stage index {} failed with {} code. Exiting", index, status),
            );
            return Ok(status);
        }

        let alias = stage
            .name
            .as_deref()
            .map(|name| format!(" AS {}", name))
            .unwrap_or_default();
        progress(
            out,
            format_args!(
                "Executing stage ({}/{}) : FROM {}{}",
                position + 1,
                total,
                stage.base,
                alias
            ),
        );
        let status = backend
            .execute_stage(
                &stage_root,
                &ctx.instance,
                ctx.os_release.as_deref().unwrap_or(""),
            )
            .context("failed to run stage execution script")?;
        if status != 0 {
            progress(
                out,
                format_args!("Execution of stage {} failed. Terminating.", position + 1),
            );
            return Ok(status);
        }
    }
    Ok(0)
}

fn commit(
    ctx: &mut BuildContext,
    backend: &dyn ProvisioningBackend,
    out: &mut dyn Write,
) -> Result<i32> {
    let Some(last) = ctx.stages.last_mut() else {
        return Ok(0);
    };
    last.is_last = true;
    let last = last.index;

    progress(out, format_args!("Build Stage(s) complete. Writing container image..."));
    write_sidecars(ctx, last)?;

    let status = backend
        .commit_image(&ImageCommit {
            build_root: ctx.build_root(),
            last_stage: last,
            image: ctx.image.clone(),
            n_stages: ctx.stages.len(),
            instance: ctx.instance.clone(),
            tag: ctx.tag.clone(),
            fim_spec: ctx.fim_spec,
        })
        .context("failed to run image commit script")?;
    if status != 0 {
        progress(out, format_args!("Image commit failed with {} code", status));
    }
    Ok(status)
}

/// `OSRELEASE`, `ENTRYPOINT` and `ARGS` beside the final stage root, read by
/// the commit script.
fn write_sidecars(ctx: &BuildContext, last: usize) -> Result<()> {
    let dir = ctx.stage_dir(last);
    let sidecars = [
        ("OSRELEASE", &ctx.os_release),
        ("ENTRYPOINT", &ctx.entry_point),
        ("ARGS", &ctx.entry_args),
    ];
    for (name, value) in sidecars {
        let Some(value) = value.as_deref().filter(|value| !value.is_empty()) else {
            continue;
        };
        let path = dir.join(name);
        fs::write(&path, value)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

fn remove_artifacts(ctx: &BuildContext) {
    for stage in &ctx.stages {
        remove_quietly(&ctx.copy_from_archive(stage.index));
        remove_quietly(&ctx.script_path(stage.index));
    }
    remove_quietly(&ctx.context_archive());
    remove_quietly(&ctx.context_file());
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => debug!(path = %path.display(), error = %err, "failed to remove build artifact"),
    }
}

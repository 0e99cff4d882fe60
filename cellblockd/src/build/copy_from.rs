//! Archives carrying COPY-FROM sources out of an earlier stage's root.
//!
//! The bootstrap script of the dependent stage unpacks each archive under
//! `/tmp/stage<N>` inside the new jail, where the stage script copies from.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;

use cellblock_common::manifest::{escapes_root, steps_for, BuildStep, StepOp};

/// Sources the steps of `stage` copy from each earlier stage, relative to
/// that stage's root.
pub fn sources_by_stage(stage: usize, steps: &[BuildStep]) -> BTreeMap<usize, Vec<String>> {
    let mut sources: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for step in steps_for(stage, steps) {
        if let StepOp::CopyFrom {
            stage: from,
            source,
            ..
        } = &step.op
        {
            let relative = relative_source(source);
            let entry = sources.entry(*from).or_default();
            if !entry.contains(&relative) {
                entry.push(relative);
            }
        }
    }
    sources
}

fn relative_source(source: &str) -> String {
    let trimmed = source.trim_start_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Write a tar of `sources` (relative to `stage_root`) to `out`. Symlinks are
/// stored as links, directories recursively.
pub fn write_archive(stage_root: &Path, sources: &[String], out: &Path) -> io::Result<()> {
    let file = File::create(out)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);

    for source in sources {
        if escapes_root(source) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("COPY FROM source {} leaves the stage root", source),
            ));
        }
        let full = stage_root.join(source);
        let meta = fs::symlink_metadata(&full).map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("COPY FROM source {}: {}", full.display(), err),
            )
        })?;
        if meta.is_dir() {
            builder.append_dir_all(source, &full)?;
        } else {
            builder.append_path_with_name(&full, source)?;
        }
    }

    builder.into_inner()?.sync_all()
}

//! Parsed build manifests as they travel over the wire.
//!
//! The manifest grammar lives in the front-end; the daemon only receives the
//! ordered stage and step lists defined here.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::protocol::{MAX_BUILD_STAGES, MAX_BUILD_STEPS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStage {
    pub index: usize,
    /// Image the stage starts from.
    pub base: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Set on the stage whose root is committed as the image.
    #[serde(default)]
    pub is_last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddKind {
    File,
    Archive,
    Url,
    ArchiveUrl,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum StepOp {
    Env {
        key: String,
        value: String,
    },
    Add {
        kind: AddKind,
        source: String,
        dest: String,
    },
    Copy {
        source: String,
        dest: String,
    },
    CopyFrom {
        stage: usize,
        source: String,
        dest: String,
    },
    Run {
        command: String,
    },
    Workdir {
        dir: String,
    },
    RootPivot {
        dir: String,
    },
}

impl StepOp {
    /// Manifest-style rendering used when the front-end sent no description.
    pub fn describe(&self) -> String {
        match self {
            StepOp::Env { key, value } => format!("ENV {}={}", key, value),
            StepOp::Add { source, dest, .. } => format!("ADD {} {}", source, dest),
            StepOp::Copy { source, dest } => format!("COPY {} {}", source, dest),
            StepOp::CopyFrom {
                stage,
                source,
                dest,
            } => format!("COPY --from={} {} {}", stage, source, dest),
            StepOp::Run { command } => format!("RUN {}", command),
            StepOp::Workdir { dir } => format!("WORKDIR {}", dir),
            StepOp::RootPivot { dir } => format!("ROOTPIVOT {}", dir),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    pub stage_index: usize,
    pub op: StepOp,
    #[serde(default)]
    pub description: String,
}

impl BuildStep {
    pub fn new(stage_index: usize, op: StepOp) -> Self {
        let description = op.describe();
        Self {
            stage_index,
            op,
            description,
        }
    }

    pub fn label(&self) -> String {
        if self.description.is_empty() {
            self.op.describe()
        } else {
            self.description.clone()
        }
    }

    pub fn copy_from_stage(&self) -> Option<usize> {
        match self.op {
            StepOp::CopyFrom { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("build has no stages")]
    NoStages,
    #[error("too many build stages/steps")]
    TooLarge,
    #[error("stage at position {position} carries index {index}")]
    NonContiguous { position: usize, index: usize },
    #[error("step {step} references unknown stage {stage}")]
    UnknownStage { step: usize, stage: usize },
    #[error("step {step} of stage {stage} copies from stage {from}, which does not run before it")]
    ForwardCopy {
        step: usize,
        stage: usize,
        from: usize,
    },
    #[error("step {step} copies {path:?}, which leaves the source stage root")]
    EscapingSource { step: usize, path: String },
}

/// True if `source` names something outside the root it is resolved in.
pub fn escapes_root(source: &str) -> bool {
    Path::new(source)
        .components()
        .any(|part| matches!(part, Component::ParentDir))
}

/// Check the structural invariants the pipeline depends on: stages indexed
/// contiguously from zero, every step owned by a declared stage, and every
/// COPY-FROM pointing at a stage that has already executed and staying
/// inside that stage's root.
pub fn validate(stages: &[BuildStage], steps: &[BuildStep]) -> Result<(), ManifestError> {
    if stages.is_empty() {
        return Err(ManifestError::NoStages);
    }
    if stages.len() > MAX_BUILD_STAGES || steps.len() > MAX_BUILD_STEPS {
        return Err(ManifestError::TooLarge);
    }
    for (position, stage) in stages.iter().enumerate() {
        if stage.index != position {
            return Err(ManifestError::NonContiguous {
                position,
                index: stage.index,
            });
        }
    }
    for (step, entry) in steps.iter().enumerate() {
        if entry.stage_index >= stages.len() {
            return Err(ManifestError::UnknownStage {
                step,
                stage: entry.stage_index,
            });
        }
        if let StepOp::CopyFrom {
            stage: from,
            source,
            ..
        } = &entry.op
        {
            if *from >= entry.stage_index {
                return Err(ManifestError::ForwardCopy {
                    step,
                    stage: entry.stage_index,
                    from: *from,
                });
            }
            if escapes_root(source) {
                return Err(ManifestError::EscapingSource {
                    step,
                    path: source.clone(),
                });
            }
        }
    }
    Ok(())
}

pub fn steps_for(stage: usize, steps: &[BuildStep]) -> impl Iterator<Item = &BuildStep> {
    steps.iter().filter(move |step| step.stage_index == stage)
}

/// Earlier stages a stage copies from, ascending and without duplicates.
pub fn stage_dependencies(stage: usize, steps: &[BuildStep]) -> Vec<usize> {
    let mut deps: Vec<usize> = steps_for(stage, steps)
        .filter_map(BuildStep::copy_from_stage)
        .collect();
    deps.sort_unstable();
    deps.dedup();
    deps
}

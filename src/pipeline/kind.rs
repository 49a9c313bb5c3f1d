//! Pipeline Protocol
//!
//! A [`ProtocolKind`] whose plan is one run-job step per pipeline entry.
//! Inputs produced by an earlier entry are looked up in the protocol's
//! working directory; all other inputs are relative to the directory of
//! the pipeline file.

use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::paths;
use crate::protocol::{Form, Params, ProtocolKind, StepPlan};

use super::model::Pipeline;
use super::parser::load_pipeline;

/// Stored class name of pipeline protocols.
pub const PIPELINE_CLASS: &str = "PipelineProtocol";

/// Protocol kind driven by a [`Pipeline`] definition.
#[derive(Debug, Clone)]
pub struct PipelineProtocol {
    pipeline: Pipeline,
    source: PathBuf,
    base_dir: PathBuf,
}

impl PipelineProtocol {
    pub fn new(pipeline: Pipeline, source: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            pipeline,
            source: source.into(),
            base_dir: base_dir.into(),
        }
    }

    /// Loads the pipeline file; relative inputs resolve against its directory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let pipeline = load_pipeline(path)?;
        let source = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let base_dir = source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self::new(pipeline, source, base_dir))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Path of the definition file, as stored in the `pipelineFile` parameter.
    pub fn source(&self) -> &Path {
        &self.source
    }
}

impl ProtocolKind for PipelineProtocol {
    fn class_name(&self) -> &str {
        PIPELINE_CLASS
    }

    fn define_params(&self, form: &mut Form) {
        form.add_string("label", &self.pipeline.name)
            .add_string("pipelineFile", &self.source.display().to_string());
    }

    fn define_steps(&self, params: &Params<'_>, plan: &mut StepPlan) {
        let working_dir = PathBuf::from(params.string("workingDir").unwrap_or("."));

        for (i, entry) in self.pipeline.steps.iter().enumerate() {
            let inputs: Vec<String> = entry
                .input
                .iter()
                .map(|file| {
                    let base = if self.pipeline.produced_before(i, file) {
                        &working_dir
                    } else {
                        &self.base_dir
                    };
                    paths::resolve(base, file).display().to_string()
                })
                .collect();

            let args = entry.resolve_args(&inputs);
            let outputs: Vec<&str> = entry.output.iter().map(String::as_str).collect();

            let step = plan.insert_run_job_step(&entry.program, &args, &outputs);
            step.set_interactive(entry.interactive);
            for input in &inputs {
                step.require(input.as_str());
            }
        }
    }
}

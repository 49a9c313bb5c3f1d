//! Pipeline Data Model
//!
//! A pipeline is an ordered list of external program steps declared in
//! YAML. Order in the file is execution order.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: preprocess
//! threads: 4
//! steps:
//!   - id: import
//!     program: cp
//!     args: "{input} {output}"
//!     input: micrographs.txt
//!     output: imported.txt
//!
//!   - id: review
//!     program: wc
//!     args: "-l {input} > {output}"
//!     input: imported.txt
//!     output: count.txt
//!     interactive: true
//! ```

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One external program run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineStep {
    /// Unique identifier within the pipeline
    pub id: String,

    /// Program to run (resolved through the shell)
    pub program: String,

    /// Argument string; `{input}` and `{output}` are substituted
    #[serde(default)]
    pub args: String,

    /// Files that must exist before the step runs
    #[serde(deserialize_with = "single_or_vec", default)]
    pub input: Vec<String>,

    /// Files the step produces, relative to the working directory
    #[serde(deserialize_with = "single_or_vec", default)]
    pub output: Vec<String>,

    /// Stop after this step until the run is continued
    #[serde(default)]
    pub interactive: bool,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl PipelineStep {
    pub fn new(id: impl Into<String>, program: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            program: program.into().trim().to_string(),
            args: args.into().trim().to_string(),
            input: Vec::new(),
            output: Vec::new(),
            interactive: false,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input.push(input.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output.push(output.into());
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// Argument string with placeholders replaced.
    pub fn resolve_args(&self, inputs: &[String]) -> String {
        let inputs_str = inputs.join(" ");
        let outputs_str = self.output.join(" ");

        self.args
            .replace("{inputs}", &inputs_str)
            .replace("{outputs}", &outputs_str)
            .replace("{input}", &inputs_str)
            .replace("{output}", &outputs_str)
    }
}

/// An ordered list of program steps plus run defaults.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    #[serde(default)]
    pub name: String,

    /// Threads handed to every program (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,

    /// Processes for the process-group launcher (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpi: Option<usize>,

    #[serde(default)]
    pub steps: Vec<PipelineStep>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_step(&mut self, step: PipelineStep) {
        self.steps.push(step);
    }

    pub fn get_step(&self, id: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether `file` is produced by a step before position `index`.
    pub fn produced_before(&self, index: usize, file: &str) -> bool {
        self.steps
            .iter()
            .take(index)
            .any(|s| s.output.iter().any(|o| o == file))
    }
}

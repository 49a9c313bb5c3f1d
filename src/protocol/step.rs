//! Step Lifecycle
//!
//! A [`Step`] is one unit of work inside a protocol: either a named
//! function of the protocol kind or an external program run. Its state is
//! kept in a persistable [`Node`] so a finished step can be stored the
//! moment it terminates.
//!
//! # State Machine
//!
//! ```text
//! created -> running -> finished
//!                    -> failed
//!                    -> waiting -> finished   (explicit approval only)
//! ```

use std::fmt;
use std::path::PathBuf;

use chrono::Local;
use log::warn;
use serde_json::Value;

use crate::error::{ExecutionError, ProtocolError};
use crate::object::{BuiltinClass, Node};
use crate::paths::missing_paths;

use super::observer::StepObserver;

/// Function identifier used by external-program steps.
pub const RUN_JOB_FUNCTION: &str = "runJob";

/// Lifecycle state of a step (and of a protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepStatus {
    Created,
    Running,
    WaitingApproval,
    Finished,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::WaitingApproval => "waiting",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" | "" => Some(Self::Created),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::WaitingApproval),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether no further transition happens without outside action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::WaitingApproval)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current local time in RFC 3339 format.
pub(crate) fn timestamp() -> String {
    Local::now().to_rfc3339()
}

/// One unit of work in a protocol plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    node: Node,
    /// Paths that must exist before the step may run.
    requires: Vec<PathBuf>,
    /// Result files a program run is expected to produce.
    declared_results: Vec<String>,
    /// 1-based position in the plan.
    index: usize,
}

impl Step {
    fn declare(class: BuiltinClass, func_name: &str, args_str: String) -> Self {
        let node = Node::new(class.as_str())
            .with_field("status", Node::string(StepStatus::Created.as_str()))
            .with_field("initTime", Node::null(BuiltinClass::String))
            .with_field("endTime", Node::null(BuiltinClass::String))
            .with_field("error", Node::null(BuiltinClass::String))
            .with_field("isInteractive", Node::boolean(false))
            .with_field("funcName", Node::string(func_name))
            .with_field("argsStr", Node::string(args_str))
            .with_field("resultFiles", Node::null(BuiltinClass::String));

        Self {
            node,
            requires: Vec::new(),
            declared_results: Vec::new(),
            index: 0,
        }
    }

    /// Declares a call of a named function of the protocol kind.
    pub fn function(func_name: &str, args: Vec<Value>) -> Self {
        let args_str = Value::Array(args).to_string();
        Self::declare(BuiltinClass::FunctionStep, func_name, args_str)
    }

    /// Declares an external program run.
    pub fn run_job(program: &str, arguments: &str, result_files: Vec<String>) -> Self {
        let args = vec![Value::from(program), Value::from(arguments)];
        let mut step = Self::declare(
            BuiltinClass::RunJobStep,
            RUN_JOB_FUNCTION,
            Value::Array(args).to_string(),
        );
        step.declared_results = result_files;
        step
    }

    /// Rebuilds a step from its stored node.
    pub fn from_node(mut node: Node) -> Result<Self, ProtocolError> {
        let class = node.class_name();
        if class != BuiltinClass::FunctionStep.as_str() && class != BuiltinClass::RunJobStep.as_str() {
            return Err(ProtocolError::Invalid(format!(
                "object {} of class '{}' is not a step",
                node.str_id(),
                class
            )));
        }
        if node.field("funcName").and_then(Node::as_str).is_none() {
            return Err(ProtocolError::Invalid(format!(
                "step {} has no function name",
                node.str_id()
            )));
        }

        for key in ["status", "initTime", "endTime", "error", "argsStr", "resultFiles"] {
            if !node.has_field(key) {
                node.set_field(key, Node::null(BuiltinClass::String));
            }
        }
        if !node.has_field("isInteractive") {
            node.set_field("isInteractive", Node::boolean(false));
        }

        Ok(Self {
            node,
            requires: Vec::new(),
            declared_results: Vec::new(),
            index: 0,
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.node.field(key).and_then(Node::as_str)
    }

    fn set_text(&mut self, key: &str, value: Option<String>) {
        match self.node.field_mut(key) {
            Some(field) => field.set_value(value),
            None => self
                .node
                .set_field(key, Node::null(BuiltinClass::String).with_value(value)),
        }
    }

    pub fn func_name(&self) -> &str {
        self.text("funcName").unwrap_or_default()
    }

    /// Serialized argument list, compared literally between runs.
    pub fn args_str(&self) -> &str {
        self.text("argsStr").unwrap_or("[]")
    }

    pub fn args(&self) -> Result<Vec<Value>, ExecutionError> {
        serde_json::from_str(self.args_str()).map_err(|e| ExecutionError::InvalidArguments {
            function: self.func_name().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn is_run_job(&self) -> bool {
        self.node.class_name() == BuiltinClass::RunJobStep.as_str()
    }

    /// Short human-readable name: the program for run jobs.
    pub fn label(&self) -> String {
        if self.is_run_job() {
            if let Ok(args) = self.args() {
                if let Some(program) = args.first().and_then(Value::as_str) {
                    return program.to_string();
                }
            }
        }
        self.func_name().to_string()
    }

    pub fn status(&self) -> StepStatus {
        self.text("status")
            .and_then(StepStatus::parse)
            .unwrap_or(StepStatus::Created)
    }

    pub fn set_status(&mut self, status: StepStatus) {
        self.set_text("status", Some(status.as_str().to_string()));
    }

    pub fn is_interactive(&self) -> bool {
        self.node
            .field("isInteractive")
            .and_then(Node::as_bool)
            .unwrap_or(false)
    }

    /// Interactive steps stop in `waiting` until approved.
    pub fn set_interactive(&mut self, interactive: bool) -> &mut Self {
        match self.node.field_mut("isInteractive") {
            Some(field) => field.set_boolean(interactive),
            None => self.node.set_field("isInteractive", Node::boolean(interactive)),
        }
        self
    }

    /// Adds a path that must exist before the step runs.
    pub fn require(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.requires.push(path.into());
        self
    }

    pub fn requirements(&self) -> &[PathBuf] {
        &self.requires
    }

    pub fn missing_requirements(&self) -> Vec<String> {
        let paths: Vec<String> = self
            .requires
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        missing_paths(&paths)
    }

    pub fn declared_results(&self) -> &[String] {
        &self.declared_results
    }

    pub fn error_message(&self) -> Option<&str> {
        self.text("error")
    }

    pub fn started_at(&self) -> Option<&str> {
        self.text("initTime")
    }

    pub fn ended_at(&self) -> Option<&str> {
        self.text("endTime")
    }

    /// Result files recorded by the last run.
    pub fn result_files(&self) -> Result<Vec<String>, serde_json::Error> {
        match self.text("resultFiles") {
            Some(raw) => serde_json::from_str(raw),
            None => Ok(Vec::new()),
        }
    }

    /// Same function identifier and literally equal serialized arguments.
    pub fn same_declaration(&self, other: &Step) -> bool {
        self.func_name() == other.func_name() && self.args_str() == other.args_str()
    }

    /// True when no result files were recorded or all of them exist.
    pub fn postconditions(&self) -> bool {
        match self.result_files() {
            Ok(files) => missing_paths(&files).is_empty(),
            Err(e) => {
                warn!("Step '{}' has unreadable result files: {}", self.label(), e);
                false
            }
        }
    }

    /// Runs the step's work and records the outcome.
    ///
    /// `work` returns the result files it produced; any of them missing on
    /// disk fails the step. The error, if any, is returned after the step
    /// has been marked failed and observers notified.
    pub fn run<F>(&mut self, observer: &mut dyn StepObserver, work: F) -> Result<(), ExecutionError>
    where
        F: FnOnce(&Step) -> Result<Vec<String>, ExecutionError>,
    {
        self.set_text("initTime", Some(timestamp()));
        self.set_text("endTime", None);
        self.set_text("error", None);
        self.set_status(StepStatus::Running);
        observer.step_started(self);

        let outcome = work(&*self).and_then(|files| self.record_results(files));

        match &outcome {
            Ok(()) if self.is_interactive() => self.set_status(StepStatus::WaitingApproval),
            Ok(()) => self.set_status(StepStatus::Finished),
            Err(e) => {
                self.set_status(StepStatus::Failed);
                self.set_text("error", Some(e.to_string()));
            }
        }

        self.set_text("endTime", Some(timestamp()));
        observer.step_finished(self);
        outcome
    }

    fn record_results(&mut self, files: Vec<String>) -> Result<(), ExecutionError> {
        let missing = missing_paths(&files);
        if !missing.is_empty() {
            return Err(ExecutionError::MissingFiles(missing));
        }
        let serialized = serde_json::to_string(&files).map_err(|e| {
            ExecutionError::Failed(format!("cannot record result files: {}", e))
        })?;
        self.set_text("resultFiles", Some(serialized));
        Ok(())
    }

    /// Moves a waiting step to finished. Returns false in any other state.
    pub fn approve(&mut self) -> bool {
        if self.status() != StepStatus::WaitingApproval {
            return false;
        }
        self.set_status(StepStatus::Finished);
        true
    }
}

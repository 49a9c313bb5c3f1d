//! Protocol Kinds
//!
//! A [`ProtocolKind`] supplies what a concrete protocol does: its declared
//! parameters, the deterministic step plan built from them, and the
//! functions its steps call. The [`Protocol`](super::Protocol) engine
//! supplies everything else.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::ExecutionError;
use crate::mapper::validate_key;
use crate::object::{BuiltinClass, Node};

use super::executor::Executor;
use super::step::Step;

/// Behavior of one protocol class.
pub trait ProtocolKind {
    /// Stored class name. Must be registered before loading.
    fn class_name(&self) -> &str;

    /// Declares the parameters, in order, with their defaults.
    fn define_params(&self, form: &mut Form);

    /// Builds the full ordered plan. Must be deterministic given `params`.
    fn define_steps(&self, params: &Params<'_>, plan: &mut StepPlan);

    /// Runs a named function step and returns the result files it produced.
    fn execute(
        &self,
        function: &str,
        _args: &[Value],
        _ctx: &mut StepContext<'_>,
    ) -> Result<Vec<String>, ExecutionError> {
        Err(ExecutionError::UnknownFunction(function.to_string()))
    }
}

/// Ordered parameter declarations of a protocol kind.
#[derive(Debug, Clone, Default)]
pub struct Form {
    params: Vec<(String, Node)>,
}

impl Form {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, name: &str, node: Node) -> &mut Self {
        self.params.retain(|(k, _)| k != name);
        self.params.push((name.to_string(), node));
        self
    }

    pub fn add_string(&mut self, name: &str, default: &str) -> &mut Self {
        self.add(name, Node::string(default))
    }

    pub fn add_integer(&mut self, name: &str, default: i64) -> &mut Self {
        self.add(name, Node::integer(default))
    }

    pub fn add_float(&mut self, name: &str, default: f64) -> &mut Self {
        self.add(name, Node::float(default))
    }

    pub fn add_boolean(&mut self, name: &str, default: bool) -> &mut Self {
        self.add(name, Node::boolean(default))
    }

    /// Declares an input reference to another stored object.
    pub fn add_pointer(&mut self, name: &str) -> &mut Self {
        self.add(name, Node::pointer(None))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub(crate) fn into_fields(self) -> Vec<(String, Node)> {
        self.params
    }
}

/// Read-only view of a protocol's parameter values.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a> {
    node: &'a Node,
}

impl<'a> Params<'a> {
    pub fn new(node: &'a Node) -> Self {
        Self { node }
    }

    pub fn node(&self, name: &str) -> Option<&'a Node> {
        self.node.field(name)
    }

    pub fn string(&self, name: &str) -> Option<&'a str> {
        self.node(name).and_then(Node::as_str)
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.node(name).and_then(Node::as_i64)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.node(name).and_then(Node::as_f64)
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.node(name).and_then(Node::as_bool)
    }

    /// Resolved target of a pointer parameter.
    pub fn input(&self, name: &str) -> Option<&'a Node> {
        self.node(name).and_then(Node::target)
    }
}

/// Builder for the ordered step plan declared by a kind.
#[derive(Debug, Default)]
pub struct StepPlan {
    steps: Vec<Step>,
}

impl StepPlan {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, mut step: Step) -> &mut Step {
        step.set_index(self.steps.len() + 1);
        self.steps.push(step);
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }

    /// Appends a call of the kind's function `name`.
    pub fn insert_function_step(&mut self, name: &str, args: Vec<Value>) -> &mut Step {
        self.push(Step::function(name, args))
    }

    /// Appends an external program run.
    pub fn insert_run_job_step(&mut self, program: &str, arguments: &str, result_files: &[&str]) -> &mut Step {
        let files = result_files.iter().map(|f| f.to_string()).collect();
        self.push(Step::run_job(program, arguments, files))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }
}

/// Everything a running step may use.
pub struct StepContext<'a> {
    working_dir: &'a Path,
    params: Params<'a>,
    executor: &'a dyn Executor,
    index: usize,
    outputs: Vec<(String, Node)>,
}

impl<'a> StepContext<'a> {
    pub fn new(working_dir: &'a Path, params: Params<'a>, executor: &'a dyn Executor, index: usize) -> Self {
        Self {
            working_dir,
            params,
            executor,
            index,
            outputs: Vec::new(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        self.working_dir
    }

    pub fn params(&self) -> &Params<'a> {
        &self.params
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor
    }

    /// 1-based position of the running step.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Path inside the working directory.
    pub fn path(&self, parts: &[&str]) -> PathBuf {
        parts.iter().fold(self.working_dir.to_path_buf(), |p, part| p.join(part))
    }

    /// Path inside the `extra/` folder.
    pub fn extra_path(&self, parts: &[&str]) -> PathBuf {
        let mut all = vec!["extra"];
        all.extend_from_slice(parts);
        self.path(&all)
    }

    /// Path inside the `tmp/` folder.
    pub fn tmp_path(&self, parts: &[&str]) -> PathBuf {
        let mut all = vec!["tmp"];
        all.extend_from_slice(parts);
        self.path(&all)
    }

    /// Runs an external program from the working directory.
    pub fn run_program(&self, program: &str, arguments: &str) -> Result<(), ExecutionError> {
        self.executor
            .run_program(program, arguments, false, Some(self.working_dir))
    }

    /// Publishes a stored output of the protocol under `name`.
    ///
    /// The name becomes a field key, so it must be non-empty and free of
    /// dots.
    pub fn define_output(&mut self, name: &str, node: Node) -> Result<(), ExecutionError> {
        validate_key(name).map_err(|e| ExecutionError::Failed(e.to_string()))?;
        self.outputs.retain(|(k, _)| k != name);
        self.outputs.push((name.to_string(), node));
        Ok(())
    }

    pub(crate) fn into_outputs(self) -> Vec<(String, Node)> {
        self.outputs
    }
}

/// Field holding the published outputs of a protocol.
pub(crate) const OUTPUTS_KEY: &str = "outputs";

pub(crate) fn empty_outputs() -> Node {
    Node::null(BuiltinClass::Object)
}
